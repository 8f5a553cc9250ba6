//! Vendor command sub-protocol carried in DFU download payloads.
//!
//! While the device is idle, the first 8 bytes of a download are a
//! command header. Multi-byte fields are little endian and block
//! numbers count [`BLOCK_SIZE`](crate::BLOCK_SIZE)-byte units:
//!
//! ```text
//! program: | 01 | -- | start block: u16 | image length: u32       |
//! read:    | 02 | -- | start block: u16 | length: u32             |
//! check:   | 03 | -- | start block: u16 | length: u32             |
//! erase:   | 04 | -- | start block: u16 | blocks: u16 | --  | --  |
//! info:    | 05 | -- | --   | --        | --   | --   | --  | --  |
//! bin:     | 06 | on | --   | --        | --   | --   | --  | --  |
//! reset:   | 07 | -- | --   | --        | --   | --   | --  | --  |
//! ```

use usb_device::bus::UsbBus;

use crate::device::{DfuDevice, UploadSource};
use crate::dfu::DfuStatus;
use crate::flash::FlashReader;
use crate::shared::{CommandFlags, MemoryBlock};
use crate::BLOCK_SIZE;

pub(crate) const CMD_PROG: u8 = 0x01;
pub(crate) const CMD_READ: u8 = 0x02;
pub(crate) const CMD_CHECK: u8 = 0x03;
pub(crate) const CMD_ERASE: u8 = 0x04;
pub(crate) const CMD_INFO: u8 = 0x05;
pub(crate) const CMD_BIN: u8 = 0x06;
pub(crate) const CMD_RESET: u8 = 0x07;

/// A parse failure; reported to the host as
/// [`ErrVendor`](crate::DfuStatus::ErrVendor).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// Fewer than 8 bytes of command header.
    TooShort,
    /// Unknown command byte.
    Unknown(u8),
}

/// A decoded download command header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DownloadCommand {
    /// Start a download of `length` bytes at `start`; the rest of this
    /// payload is the first image chunk.
    Program {
        /// First destination address.
        start: u32,
        /// Declared image length in bytes.
        length: u32,
    },
    /// Point the upload block at a flash range.
    Read {
        /// First address to serve.
        start: u32,
        /// Range length in bytes.
        length: u32,
    },
    /// Verify that a flash range is erased.
    Check {
        /// First address to verify.
        start: u32,
        /// Range length in bytes.
        length: u32,
    },
    /// Queue a deferred erase of whole blocks.
    Erase {
        /// First address to erase.
        start: u32,
        /// Number of reported-size blocks.
        blocks: u16,
    },
    /// Serve the device information record on the next upload.
    Info,
    /// Switch raw binary upload mode on or off.
    Binary(bool),
    /// Queue a deferred system reset.
    Reset,
}

impl DownloadCommand {
    /// Decodes an 8-byte command header.
    pub fn parse(data: &[u8]) -> Result<Self, CommandError> {
        if data.len() < 8 {
            return Err(CommandError::TooShort);
        }
        let start = u16::from_le_bytes([data[2], data[3]]) as u32 * BLOCK_SIZE;
        let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        match data[0] {
            CMD_PROG => Ok(Self::Program { start, length }),
            CMD_READ => Ok(Self::Read { start, length }),
            CMD_CHECK => Ok(Self::Check { start, length }),
            CMD_ERASE => Ok(Self::Erase {
                start,
                blocks: u16::from_le_bytes([data[4], data[5]]),
            }),
            CMD_INFO => Ok(Self::Info),
            CMD_BIN => Ok(Self::Binary(data[1] != 0)),
            CMD_RESET => Ok(Self::Reset),
            other => Err(CommandError::Unknown(other)),
        }
    }

    /// The wire command byte.
    pub fn code(&self) -> u8 {
        match self {
            Self::Program { .. } => CMD_PROG,
            Self::Read { .. } => CMD_READ,
            Self::Check { .. } => CMD_CHECK,
            Self::Erase { .. } => CMD_ERASE,
            Self::Info => CMD_INFO,
            Self::Binary(_) => CMD_BIN,
            Self::Reset => CMD_RESET,
        }
    }
}

impl<'a, B: UsbBus, M: FlashReader> DfuDevice<'a, B, M> {
    /// Parses and applies the command at the start of the transfer
    /// buffer. On failure the DFU status carries the reason and the
    /// caller latches the error state.
    pub(crate) fn process_download_command(&mut self, length: usize) -> bool {
        // SAFETY: no deferred write is outstanding while the device is
        // idle, so the interrupt half owns the buffer.
        let buf = unsafe { self.shared.transfer_buffer() };
        let command = match DownloadCommand::parse(&buf[..length]) {
            Ok(command) => command,
            Err(_) => {
                self.status = DfuStatus::ErrVendor;
                return false;
            }
        };
        self.last_command = command.code();

        match command {
            DownloadCommand::Program {
                start,
                length: image_length,
            } => {
                let block = MemoryBlock::new(start, image_length);
                if !self.config.range_valid(block) {
                    self.status = DfuStatus::ErrAddress;
                    return false;
                }
                self.next_upload = block;
                self.upload_source = UploadSource::Flash;
                self.shared.next_download.store(block);
                self.shared.set_image_size(image_length);
                self.shared.stage_write(8, length - 8);
                if self.config.code_protection {
                    // everything is erased up front, per-write erases
                    // are skipped by the scheduler
                    self.shared.pending_erase.store(self.config.app_region());
                    self.shared.flags.raise(CommandFlags::ERASE);
                }
                self.shared.flags.raise(CommandFlags::WRITE);
                true
            }
            DownloadCommand::Read {
                start,
                length: range,
            } => {
                let block = MemoryBlock::new(start, range);
                if !self.config.range_valid(block) {
                    self.status = DfuStatus::ErrAddress;
                    return false;
                }
                self.next_upload = block;
                self.upload_source = UploadSource::Flash;
                true
            }
            DownloadCommand::Check {
                start,
                length: range,
            } => {
                let block = MemoryBlock::new(start, range);
                if !self.config.range_valid(block) {
                    self.status = DfuStatus::ErrCheckErased;
                    return false;
                }
                for offset in (0..range / 4).map(|word| word * 4) {
                    if self.reader.read_word(start + offset) != 0xffff_ffff {
                        self.status = DfuStatus::ErrCheckErased;
                        return false;
                    }
                }
                self.status = DfuStatus::Ok;
                true
            }
            DownloadCommand::Erase { start, blocks } => {
                let range = blocks as u32 * self.config.reported_page_size();
                let block = MemoryBlock::new(start, range);
                if !self.config.range_valid(block) {
                    self.status = DfuStatus::ErrAddress;
                    return false;
                }
                self.shared.pending_erase.store(block);
                self.shared.flags.raise(CommandFlags::ERASE);
                true
            }
            DownloadCommand::Info => {
                self.next_upload = MemoryBlock::new(0, crate::config::DeviceInfo::SIZE as u32);
                self.upload_source = UploadSource::Info;
                self.suppress_header = true;
                true
            }
            DownloadCommand::Binary(on) => {
                self.binary_mode = on;
                true
            }
            DownloadCommand::Reset => {
                self.shared.flags.raise(CommandFlags::RESET);
                true
            }
        }
    }
}
