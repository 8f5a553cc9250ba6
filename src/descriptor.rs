//! USB descriptors, kept as typed structures and serialized on demand.

use crate::config::BootConfig;
use crate::TRANSFER_SIZE;

pub(crate) const DESC_TYPE_DEVICE: u8 = 1;
pub(crate) const DESC_TYPE_CONFIGURATION: u8 = 2;
pub(crate) const DESC_TYPE_STRING: u8 = 3;
pub(crate) const DESC_TYPE_INTERFACE: u8 = 4;
pub(crate) const DESC_TYPE_DFU_FUNCTIONAL: u8 = 0x21;

const USB_RELEASE: u16 = 0x0110;
const CLASS_VENDOR_SPECIFIC: u8 = 0xff;
const CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;
const SUBCLASS_DFU: u8 = 0x01;
const PROTOCOL_DFU_MODE: u8 = 0x02;

const LANG_EN_US: u16 = 0x0409;

/// String descriptor indices used by the device.
pub(crate) const STRING_MANUFACTURER: u8 = 1;
pub(crate) const STRING_PRODUCT: u8 = 2;
pub(crate) const STRING_SERIAL: u8 = 3;

pub(crate) struct DeviceDescriptor {
    usb_release: u16,
    device_class: u8,
    max_packet_size0: u8,
    vendor_id: u16,
    product_id: u16,
    device_release: u16,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn new(config: &BootConfig, max_packet_size0: u8) -> Self {
        Self {
            usb_release: USB_RELEASE,
            device_class: CLASS_VENDOR_SPECIFIC,
            max_packet_size0,
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            device_release: config.device_release,
        }
    }

    pub fn write_to(&self, dest: &mut [u8]) -> usize {
        dest[0] = Self::SIZE as u8;
        dest[1] = DESC_TYPE_DEVICE;
        dest[2..4].copy_from_slice(&self.usb_release.to_le_bytes());
        dest[4] = self.device_class;
        dest[5] = 0; // subclass
        dest[6] = 0; // protocol
        dest[7] = self.max_packet_size0;
        dest[8..10].copy_from_slice(&self.vendor_id.to_le_bytes());
        dest[10..12].copy_from_slice(&self.product_id.to_le_bytes());
        dest[12..14].copy_from_slice(&self.device_release.to_le_bytes());
        dest[14] = STRING_MANUFACTURER;
        dest[15] = STRING_PRODUCT;
        dest[16] = STRING_SERIAL;
        dest[17] = 1; // one configuration
        Self::SIZE
    }
}

struct ConfigurationDescriptor {
    total_length: u16,
    attributes: u8,
    max_power_2ma: u8,
}

impl ConfigurationDescriptor {
    const SIZE: usize = 9;

    fn write_to(&self, dest: &mut [u8]) -> usize {
        dest[0] = Self::SIZE as u8;
        dest[1] = DESC_TYPE_CONFIGURATION;
        dest[2..4].copy_from_slice(&self.total_length.to_le_bytes());
        dest[4] = 1; // one interface
        dest[5] = 1; // configuration value
        dest[6] = 0; // no configuration string
        dest[7] = self.attributes;
        dest[8] = self.max_power_2ma;
        Self::SIZE
    }
}

struct InterfaceDescriptor;

impl InterfaceDescriptor {
    const SIZE: usize = 9;

    fn write_to(&self, dest: &mut [u8]) -> usize {
        dest[0] = Self::SIZE as u8;
        dest[1] = DESC_TYPE_INTERFACE;
        dest[2] = 0; // interface number
        dest[3] = 0; // alternate setting
        dest[4] = 0; // no endpoints beyond EP0
        dest[5] = CLASS_APPLICATION_SPECIFIC;
        dest[6] = SUBCLASS_DFU;
        dest[7] = PROTOCOL_DFU_MODE;
        dest[8] = 0; // no interface string
        Self::SIZE
    }
}

/// DFU functional descriptor.
struct FunctionalDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl FunctionalDescriptor {
    const SIZE: usize = 9;

    // bmAttributes: can download, can upload, manifestation tolerant.
    const ATTR_CAN_DNLOAD: u8 = 0x01;
    const ATTR_CAN_UPLOAD: u8 = 0x02;
    const ATTR_MANIFEST_TOLERANT: u8 = 0x04;

    fn write_to(&self, dest: &mut [u8]) -> usize {
        dest[0] = Self::SIZE as u8;
        dest[1] = DESC_TYPE_DFU_FUNCTIONAL;
        dest[2] = self.attributes;
        dest[3..5].copy_from_slice(&self.detach_timeout.to_le_bytes());
        dest[5..7].copy_from_slice(&self.transfer_size.to_le_bytes());
        dest[7..9].copy_from_slice(&self.dfu_version.to_le_bytes());
        Self::SIZE
    }
}

const DFU_FUNCTIONAL: FunctionalDescriptor = FunctionalDescriptor {
    attributes: FunctionalDescriptor::ATTR_CAN_DNLOAD
        | FunctionalDescriptor::ATTR_CAN_UPLOAD
        | FunctionalDescriptor::ATTR_MANIFEST_TOLERANT,
    detach_timeout: 0xffff,
    transfer_size: TRANSFER_SIZE as u16,
    dfu_version: 0x0110,
};

/// Total length of the configuration descriptor set.
pub(crate) const CONFIGURATION_TOTAL_LENGTH: usize =
    ConfigurationDescriptor::SIZE + InterfaceDescriptor::SIZE + FunctionalDescriptor::SIZE;

/// Serializes the whole configuration descriptor set: configuration,
/// DFU interface and DFU functional descriptor.
pub(crate) fn write_configuration(config: &BootConfig, dest: &mut [u8]) -> usize {
    let configuration = ConfigurationDescriptor {
        total_length: CONFIGURATION_TOTAL_LENGTH as u16,
        attributes: if config.self_powered { 0xc0 } else { 0x80 },
        max_power_2ma: (config.max_power_ma / 2) as u8,
    };
    let mut pos = configuration.write_to(dest);
    pos += InterfaceDescriptor.write_to(&mut dest[pos..]);
    pos += DFU_FUNCTIONAL.write_to(&mut dest[pos..]);
    pos
}

/// Serializes string descriptor `index` for language `lang_id`.
///
/// Index zero is the language table; it ignores `lang_id`. Returns
/// `None` for unknown indices or languages.
pub(crate) fn write_string(
    config: &BootConfig,
    index: u8,
    lang_id: u16,
    dest: &mut [u8],
) -> Option<usize> {
    if index == 0 {
        dest[0] = 4;
        dest[1] = DESC_TYPE_STRING;
        dest[2..4].copy_from_slice(&LANG_EN_US.to_le_bytes());
        return Some(4);
    }
    if lang_id != LANG_EN_US {
        return None;
    }
    let text = match index {
        STRING_MANUFACTURER => config.manufacturer,
        STRING_PRODUCT => config.product,
        STRING_SERIAL => config.serial_number,
        _ => return None,
    };
    Some(write_utf16(text, dest))
}

fn write_utf16(text: &str, dest: &mut [u8]) -> usize {
    let mut pos = 2;
    for unit in text.encode_utf16() {
        if pos + 2 > dest.len() {
            break;
        }
        dest[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
        pos += 2;
    }
    dest[0] = pos as u8;
    dest[1] = DESC_TYPE_STRING;
    pos
}
