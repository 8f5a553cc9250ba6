//! State exchanged between the USB interrupt context and the flash
//! polling loop.
//!
//! The two halves of the bootloader never call each other. The interrupt
//! half publishes work by filling in the fields below and raising a bit
//! in [`CommandFlags`], the polling half performs the operation and
//! clears the bit. A raised bit transfers ownership of the associated
//! fields (and, for a write, of the transfer buffer) to the polling
//! half until it is cleared again.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::dfu::DfuStatus;
use crate::TRANSFER_SIZE;

/// A half-open flash address range `[start, start + length)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct MemoryBlock {
    /// First byte address covered by the block.
    pub start: u32,
    /// Number of bytes remaining in the block.
    pub length: u32,
}

impl MemoryBlock {
    /// Creates a block covering `length` bytes starting at `start`.
    pub const fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    /// Consumes `count` bytes from the front of the block.
    ///
    /// `count` must not exceed the remaining length.
    pub fn advance(&mut self, count: u32) {
        self.start = self.start.wrapping_add(count);
        self.length = self.length.saturating_sub(count);
    }
}

/// Deferred operation requests, raised from interrupt context and
/// consumed by the flash scheduler.
pub struct CommandFlags(AtomicU8);

impl CommandFlags {
    /// Erase the `pending_erase` block.
    pub const ERASE: u8 = 0x01;
    /// Program the staged transfer buffer bytes at `next_download`.
    pub const WRITE: u8 = 0x02;
    /// Reset the system.
    pub const RESET: u8 = 0x04;

    const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Raises `flag` after its payload fields have been written.
    pub fn raise(&self, flag: u8) {
        self.0.fetch_or(flag, Ordering::Release);
    }

    /// Clears `flag` after the operation and its result fields are done.
    pub fn clear(&self, flag: u8) {
        self.0.fetch_and(!flag, Ordering::Release);
    }

    /// Snapshot of the currently raised flags.
    pub fn pending(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// True when no operation is outstanding.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

/// A [`MemoryBlock`] whose fields can be updated from either context.
///
/// The words themselves are only `Relaxed`; publication happens through
/// the flag raise/clear edges in [`CommandFlags`].
pub struct SharedBlock {
    start: AtomicU32,
    length: AtomicU32,
}

impl SharedBlock {
    const fn new() -> Self {
        Self {
            start: AtomicU32::new(0),
            length: AtomicU32::new(0),
        }
    }

    /// Reads the block.
    pub fn load(&self) -> MemoryBlock {
        MemoryBlock {
            start: self.start.load(Ordering::Relaxed),
            length: self.length.load(Ordering::Relaxed),
        }
    }

    /// Replaces the block.
    pub fn store(&self, block: MemoryBlock) {
        self.start.store(block.start, Ordering::Relaxed);
        self.length.store(block.length, Ordering::Relaxed);
    }
}

/// Exchange structure connecting [`DfuDevice`](crate::DfuDevice) and
/// [`FlashScheduler`](crate::FlashScheduler).
///
/// Construction is `const`, so the usual deployment is a `static`:
///
/// ```
/// use usbd_dfu_boot::Shared;
///
/// static SHARED: Shared = Shared::new();
/// ```
pub struct Shared {
    /// Outstanding deferred operations.
    pub(crate) flags: CommandFlags,
    /// Where the next received download bytes will be programmed.
    /// Written by the interrupt half when a Program command arrives and
    /// advanced by the scheduler as chunks are written.
    pub(crate) next_download: SharedBlock,
    /// Range to erase when [`CommandFlags::ERASE`] is raised.
    pub(crate) pending_erase: SharedBlock,
    /// Offset of the staged write data inside the transfer buffer.
    write_offset: AtomicUsize,
    /// Number of staged write bytes.
    write_length: AtomicUsize,
    /// Total image length declared by the Program command, for progress
    /// reporting.
    image_size: AtomicU32,
    /// Status code reported by the scheduler, `0` when none. Folded into
    /// the DFU status by the next GetStatus.
    pub(crate) error: AtomicU8,
    buffer: UnsafeCell<[u8; TRANSFER_SIZE]>,
}

// The interior mutability is limited to atomics and the flag-guarded
// transfer buffer.
unsafe impl Sync for Shared {}

impl Shared {
    /// Creates an empty exchange structure.
    pub const fn new() -> Self {
        Self {
            flags: CommandFlags::new(),
            next_download: SharedBlock::new(),
            pending_erase: SharedBlock::new(),
            write_offset: AtomicUsize::new(0),
            write_length: AtomicUsize::new(0),
            image_size: AtomicU32::new(0),
            error: AtomicU8::new(0),
            buffer: UnsafeCell::new([0; TRANSFER_SIZE]),
        }
    }

    /// Access to the transfer buffer.
    ///
    /// # Safety
    ///
    /// The caller must be the current owner of the buffer: the interrupt
    /// half while [`CommandFlags::WRITE`] is clear, the scheduler while
    /// it is raised. Both halves are single threaded within themselves,
    /// so the returned reference must not outlive the current
    /// poll/handler invocation.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn transfer_buffer(&self) -> &mut [u8; TRANSFER_SIZE] {
        &mut *self.buffer.get()
    }

    /// Records a scheduler failure for the interrupt half to report.
    pub(crate) fn report_error(&self, status: DfuStatus) {
        self.error.store(status as u8, Ordering::Release);
    }

    /// Takes a previously recorded scheduler failure, if any.
    pub(crate) fn take_error(&self) -> Option<DfuStatus> {
        match self.error.swap(0, Ordering::AcqRel) {
            0 => None,
            code => DfuStatus::from_code(code),
        }
    }

    /// Stages `length` bytes at `offset` inside the transfer buffer for
    /// the scheduler to program. Must be followed by raising
    /// [`CommandFlags::WRITE`].
    pub(crate) fn stage_write(&self, offset: usize, length: usize) {
        self.write_offset.store(offset, Ordering::Relaxed);
        self.write_length.store(length, Ordering::Relaxed);
    }

    /// The staged write window inside the transfer buffer, as
    /// `(offset, length)`.
    pub(crate) fn staged_write(&self) -> (usize, usize) {
        (
            self.write_offset.load(Ordering::Relaxed),
            self.write_length.load(Ordering::Relaxed),
        )
    }

    /// Records the image length declared by a Program command.
    pub(crate) fn set_image_size(&self, length: u32) {
        self.image_size.store(length, Ordering::Relaxed);
    }

    /// The declared image length.
    pub(crate) fn image_size(&self) -> u32 {
        self.image_size.load(Ordering::Relaxed)
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}
