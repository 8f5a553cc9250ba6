//! DFU class state machine.
//!
//! Request routing is per DFU state: every state accepts a small set of
//! class requests and stalls everything else. The one exception is the
//! vendor protocol query, which is answered before the state dispatch
//! so that a host can query the device at any time.

use usb_device::bus::UsbBus;
use usb_device::UsbDirection;

use crate::device::{DfuDevice, TxSource, UploadSource};
use crate::ep0::SetupPacket;
use crate::flash::FlashReader;
use crate::shared::CommandFlags;
use crate::{BLOCK_SIZE, TRANSFER_SIZE};

/// DFU request codes.
pub(crate) const DFU_DNLOAD: u8 = 1;
pub(crate) const DFU_UPLOAD: u8 = 2;
pub(crate) const DFU_GETSTATUS: u8 = 3;
pub(crate) const DFU_CLRSTATUS: u8 = 4;
pub(crate) const DFU_GETSTATE: u8 = 5;
pub(crate) const DFU_ABORT: u8 = 6;

/// Vendor protocol query request and its expected wValue.
pub(crate) const REQUEST_QUERY: u8 = 0x42;
pub(crate) const QUERY_VALUE: u16 = 0x23;

/// Marker and version returned by the protocol query.
pub(crate) const PROTOCOL_MARKER: u16 = 0x4c4d;
pub(crate) const PROTOCOL_VERSION: u16 = 0x0001;

/// Constant bwPollTimeout reported by GetStatus, in milliseconds.
pub(crate) const POLL_TIMEOUT_MS: u8 = 5;

/// DFU device state as reported by GetState/GetStatus.
///
/// `DownloadBusy` carries its wire value but is never entered: the
/// device holds `DownloadSync` until the deferred flash operation
/// completes, so the host polls with GetStatus only.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuState {
    /// Application idle (unused, the device boots in DFU mode).
    AppIdle = 0,
    /// Application detach (unused).
    AppDetach = 1,
    /// Ready for a command.
    Idle = 2,
    /// Download chunk received, waiting for GetStatus.
    DownloadSync = 3,
    /// Busy programming (never entered, see above).
    DownloadBusy = 4,
    /// Mid-download, expecting more chunks.
    DownloadIdle = 5,
    /// Download finished, waiting for GetStatus.
    ManifestSync = 6,
    /// Manifestation in progress (never entered).
    Manifest = 7,
    /// Waiting for reset after manifestation (never entered).
    ManifestWaitReset = 8,
    /// Mid-upload, expecting more upload requests.
    UploadIdle = 9,
    /// An error was latched; cleared by ClearStatus.
    Error = 10,
}

/// DFU status codes as reported by GetStatus.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuStatus {
    /// No error.
    Ok = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File fails a vendor-specific verification.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Erase failed.
    ErrErase = 0x04,
    /// Memory did not verify as erased.
    ErrCheckErased = 0x05,
    /// Program failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Address out of range.
    ErrAddress = 0x08,
    /// Download ended before the declared image was complete.
    ErrNotDone = 0x09,
    /// Firmware is corrupt.
    ErrFirmware = 0x0a,
    /// Vendor-specific error (unknown command).
    ErrVendor = 0x0b,
    /// Unexpected USB reset.
    ErrUsbR = 0x0c,
    /// Unexpected power on reset.
    ErrPor = 0x0d,
    /// Unknown error.
    ErrUnknown = 0x0e,
    /// Unexpected request.
    ErrStalledPkt = 0x0f,
}

impl DfuStatus {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0a => Self::ErrFirmware,
            0x0b => Self::ErrVendor,
            0x0c => Self::ErrUsbR,
            0x0d => Self::ErrPor,
            0x0e => Self::ErrUnknown,
            0x0f => Self::ErrStalledPkt,
            _ => return None,
        })
    }
}

impl<'a, B: UsbBus, M: FlashReader> DfuDevice<'a, B, M> {
    /// Routes a class or vendor request.
    pub(crate) fn handle_class_request(&mut self, req: SetupPacket) {
        if req.request == REQUEST_QUERY {
            // answered in every DFU state
            self.handle_query(req);
            return;
        }
        match self.state {
            DfuState::Idle => self.state_idle(req),
            DfuState::DownloadSync | DfuState::DownloadBusy => self.state_download_sync(req),
            DfuState::DownloadIdle => self.state_download_idle(req),
            DfuState::ManifestSync => self.state_manifest_sync(req),
            DfuState::UploadIdle => self.state_upload_idle(req),
            DfuState::Error => self.state_error(req),
            _ => self.pipe.stall(&self.bus),
        }
    }

    /// Vendor protocol query: `{marker, version}` when wValue and
    /// wLength match, stall otherwise.
    fn handle_query(&mut self, req: SetupPacket) {
        if req.direction == UsbDirection::In && req.value == QUERY_VALUE && req.length == 4 {
            self.scratch[0..2].copy_from_slice(&PROTOCOL_MARKER.to_le_bytes());
            self.scratch[2..4].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
            self.tx_from_scratch(4);
        } else {
            self.pipe.stall(&self.bus);
        }
    }

    fn state_idle(&mut self, req: SetupPacket) {
        match req.request {
            DFU_DNLOAD => {
                let length = req.length as usize;
                if length == 0 || length > TRANSFER_SIZE {
                    self.pipe.stall(&self.bus);
                } else {
                    self.pipe.request_data(length);
                }
            }
            DFU_UPLOAD => {
                let header = !self.suppress_header && !self.binary_mode;
                if self.send_upload(req.length, header) {
                    self.state = DfuState::UploadIdle;
                }
                self.suppress_header = false;
            }
            DFU_GETSTATUS => self.send_status(),
            DFU_GETSTATE => self.send_state(),
            DFU_CLRSTATUS => {
                // idempotent: already idle, just reconfirm Ok
                self.status = DfuStatus::Ok;
                self.pipe.acknowledge(&self.bus);
            }
            DFU_ABORT => self.pipe.acknowledge(&self.bus),
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn state_download_sync(&mut self, req: SetupPacket) {
        match req.request {
            DFU_GETSTATUS => {
                if self.state == DfuState::DownloadSync && self.shared.flags.is_idle() {
                    if let Some(error) = self.shared.take_error() {
                        self.status = error;
                        self.state = DfuState::Error;
                    } else if self.last_command == crate::command::CMD_PROG {
                        self.state = DfuState::DownloadIdle;
                    } else {
                        self.state = DfuState::Idle;
                    }
                }
                self.send_status();
            }
            DFU_GETSTATE if self.state == DfuState::DownloadSync => self.send_state(),
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn state_download_idle(&mut self, req: SetupPacket) {
        match req.request {
            DFU_DNLOAD => {
                let length = req.length as usize;
                if length == 0 {
                    // host declared the download complete
                    if self.shared.next_download.load().length != 0 {
                        self.status = DfuStatus::ErrNotDone;
                        self.state = DfuState::Error;
                    } else {
                        self.state = DfuState::ManifestSync;
                    }
                    self.pipe.acknowledge(&self.bus);
                } else if length > TRANSFER_SIZE {
                    self.pipe.stall(&self.bus);
                } else {
                    self.pipe.request_data(length);
                }
            }
            DFU_GETSTATUS => self.send_status(),
            DFU_GETSTATE => self.send_state(),
            DFU_ABORT => {
                // give up on the download, back to the defaults
                self.reset_upload_range();
                self.shared.next_download.store(self.config.app_region());
                self.state = DfuState::Idle;
                self.pipe.acknowledge(&self.bus);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn state_manifest_sync(&mut self, req: SetupPacket) {
        match req.request {
            DFU_GETSTATUS => {
                // manifestation is a no-op, go straight back to idle
                self.state = DfuState::Idle;
                self.send_status();
            }
            DFU_GETSTATE => self.send_state(),
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn state_upload_idle(&mut self, req: SetupPacket) {
        match req.request {
            DFU_UPLOAD => {
                // continuation chunks never carry a header
                if !self.send_upload(req.length, false) {
                    self.reset_upload_range();
                    self.state = DfuState::Idle;
                }
            }
            DFU_GETSTATUS => self.send_status(),
            DFU_GETSTATE => self.send_state(),
            DFU_ABORT => {
                self.reset_upload_range();
                self.shared.next_download.store(self.config.app_region());
                self.state = DfuState::Idle;
                self.pipe.acknowledge(&self.bus);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn state_error(&mut self, req: SetupPacket) {
        match req.request {
            DFU_GETSTATUS => self.send_status(),
            DFU_GETSTATE => self.send_state(),
            DFU_CLRSTATUS => {
                self.status = DfuStatus::Ok;
                self.state = DfuState::Idle;
                self.pipe.acknowledge(&self.bus);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    /// Sends the 6-byte GetStatus response, recomputed on demand.
    pub(crate) fn send_status(&mut self) {
        let frame = [
            self.status as u8,
            POLL_TIMEOUT_MS,
            0,
            0,
            self.state as u8,
            0, // iString, no vendor error strings
        ];
        self.scratch[..6].copy_from_slice(&frame);
        self.tx_from_scratch(6);
    }

    /// Sends the 1-byte GetState response.
    pub(crate) fn send_state(&mut self) {
        self.scratch[0] = self.state as u8;
        self.tx_from_scratch(1);
    }

    /// Serves an upload chunk from the current upload block.
    ///
    /// When `with_header` is set the chunk is prefixed with a Program
    /// command header describing the remaining block, so a captured
    /// image can be downloaded back verbatim. Returns true when the
    /// chunk was full sized and data remains, i.e. the host should keep
    /// requesting.
    fn send_upload(&mut self, requested: u16, with_header: bool) -> bool {
        let header_len: u32 = if with_header { 8 } else { 0 };
        let available = self.next_upload.length + header_len;
        let to_send = u32::min(
            u32::min(requested as u32, TRANSFER_SIZE as u32),
            available,
        );

        // SAFETY: no write is staged while an upload is served, so the
        // interrupt half owns the buffer.
        let buf = unsafe { self.shared.transfer_buffer() };
        let mut pos = 0usize;
        if with_header {
            let mut header = [0u8; 8];
            header[0] = crate::command::CMD_PROG;
            header[2..4]
                .copy_from_slice(&((self.next_upload.start / BLOCK_SIZE) as u16).to_le_bytes());
            header[4..8].copy_from_slice(&self.next_upload.length.to_le_bytes());
            let copy = usize::min(to_send as usize, 8);
            buf[..copy].copy_from_slice(&header[..copy]);
            pos = copy;
        }

        let data_len = (to_send - u32::min(header_len, to_send)) as usize;
        match self.upload_source {
            UploadSource::Flash => {
                self.reader
                    .read(self.next_upload.start, &mut buf[pos..pos + data_len]);
            }
            UploadSource::Info => {
                let mut record = [0u8; crate::config::DeviceInfo::SIZE];
                self.info.write_to(&mut record);
                let offset = self.next_upload.start as usize;
                buf[pos..pos + data_len].copy_from_slice(&record[offset..offset + data_len]);
            }
        }
        self.next_upload.advance(data_len as u32);

        self.tx_source = TxSource::Transfer;
        let total = pos + data_len;
        self.pipe.send_data(&self.bus, &buf[..total]);

        to_send == TRANSFER_SIZE as u32 && self.next_upload.length != 0
    }

    /// Points the upload block back at the whole application region.
    pub(crate) fn reset_upload_range(&mut self) {
        self.next_upload = self.config.app_region();
        self.upload_source = UploadSource::Flash;
    }

    /// A download data stage completed with `length` bytes in the
    /// transfer buffer.
    pub(crate) fn handle_ep0_data(&mut self, length: usize) {
        match self.state {
            DfuState::Idle => {
                // first chunk of a download carries a command header
                if self.process_download_command(length) {
                    self.state = DfuState::DownloadSync;
                } else {
                    self.state = DfuState::Error;
                }
            }
            DfuState::DownloadIdle => {
                // continuation chunk, queue it for programming
                self.shared.stage_write(0, length);
                self.shared.flags.raise(CommandFlags::WRITE);
                self.state = DfuState::DownloadSync;
            }
            _ => {}
        }
    }
}
