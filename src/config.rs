//! Board configuration and the device information record.

use crate::shared::MemoryBlock;

/// Largest flash block size reported to the host. Devices with larger
/// physical pages report this value instead and accept erase ranges
/// expressed in reported blocks.
pub const MAX_REPORTED_PAGE_SIZE: u32 = 0x8000;

/// Static board and USB identity configuration.
///
/// Passed by value to both bootloader halves at construction.
#[derive(Clone, Copy)]
pub struct BootConfig {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// BCD device release number.
    pub device_release: u16,
    /// Manufacturer string descriptor.
    pub manufacturer: &'static str,
    /// Product string descriptor.
    pub product: &'static str,
    /// Serial number string descriptor.
    pub serial_number: &'static str,
    /// Report the device as self powered.
    pub self_powered: bool,
    /// Maximum bus current draw in mA.
    pub max_power_ma: u16,
    /// Total flash size in bytes.
    pub flash_size: u32,
    /// Physical flash page size in bytes (erase granularity).
    pub page_size: u32,
    /// First address of the application image. Everything below is the
    /// bootloader itself.
    pub app_start: u32,
    /// Bytes reserved at the top of flash (parameter blocks and the
    /// like), excluded from the writable region.
    pub reserved_space: u32,
    /// Part identification word reported in the device information
    /// record.
    pub part_info: u32,
    /// Device class identification word reported in the device
    /// information record.
    pub class_info: u32,
    /// The whole application region is erased before the first write of
    /// a download and per-write page erases are skipped.
    pub code_protection: bool,
    /// Permit downloads below `app_start`, i.e. updating the bootloader
    /// itself.
    pub allow_self_update: bool,
}

impl BootConfig {
    /// First address above the writable flash region.
    pub const fn flash_top(&self) -> u32 {
        self.flash_size - self.reserved_space
    }

    /// Flash block size reported to the host, capped at
    /// [`MAX_REPORTED_PAGE_SIZE`].
    pub const fn reported_page_size(&self) -> u32 {
        if self.page_size > MAX_REPORTED_PAGE_SIZE {
            MAX_REPORTED_PAGE_SIZE
        } else {
            self.page_size
        }
    }

    /// The default upload/download region: the whole application image
    /// area.
    pub(crate) const fn app_region(&self) -> MemoryBlock {
        MemoryBlock::new(self.app_start, self.flash_top() - self.app_start)
    }

    /// Validates a requested transfer range.
    ///
    /// The range must lie inside `[app_start, flash_top)` (inside
    /// `[0, flash_top)` when self update is allowed) and must not be
    /// longer than the application region.
    pub(crate) fn range_valid(&self, block: MemoryBlock) -> bool {
        let top = self.flash_top();
        let lower = if self.allow_self_update {
            0
        } else {
            self.app_start
        };
        let end = match block.start.checked_add(block.length) {
            Some(end) => end,
            None => return false,
        };
        block.start >= lower && block.length <= top - self.app_start && end <= top
    }
}

/// The 20-byte device information record served by the Info command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Reported flash block size in bytes.
    pub flash_block_size: u16,
    /// Number of reported blocks in flash.
    pub num_flash_blocks: u16,
    /// Part identification word.
    pub part_info: u32,
    /// Device class identification word.
    pub class_info: u32,
    /// First address above the writable flash region.
    pub flash_top: u32,
    /// First address of the application image.
    pub app_start_addr: u32,
}

impl DeviceInfo {
    /// Serialized size in bytes.
    pub const SIZE: usize = 20;

    /// Builds the record from the board configuration.
    pub fn new(config: &BootConfig) -> Self {
        let block = config.reported_page_size();
        Self {
            flash_block_size: block as u16,
            num_flash_blocks: (config.flash_size / block) as u16,
            part_info: config.part_info,
            class_info: config.class_info,
            flash_top: config.flash_top(),
            app_start_addr: config.app_start,
        }
    }

    /// Serializes the record into `dest` and returns [`Self::SIZE`].
    pub fn write_to(&self, dest: &mut [u8]) -> usize {
        dest[0..2].copy_from_slice(&self.flash_block_size.to_le_bytes());
        dest[2..4].copy_from_slice(&self.num_flash_blocks.to_le_bytes());
        dest[4..8].copy_from_slice(&self.part_info.to_le_bytes());
        dest[8..12].copy_from_slice(&self.class_info.to_le_bytes());
        dest[12..16].copy_from_slice(&self.flash_top.to_le_bytes());
        dest[16..20].copy_from_slice(&self.app_start_addr.to_le_bytes());
        Self::SIZE
    }
}
