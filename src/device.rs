//! USB device half of the bootloader: poll loop, request dispatch and
//! the standard request handlers.

use core::cmp::min;

use usb_device::bus::{PollResult, UsbBus};
use usb_device::control::{Recipient, RequestType};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

use crate::config::{BootConfig, DeviceInfo};
use crate::descriptor::{self, DeviceDescriptor};
use crate::dfu::{DfuState, DfuStatus};
use crate::ep0::{ControlPipe, Ep0State, SetupPacket, EP0_MAX_PACKET};
use crate::flash::FlashReader;
use crate::shared::{CommandFlags, MemoryBlock, Shared};

// Standard request codes.
const STD_GET_STATUS: u8 = 0;
const STD_CLEAR_FEATURE: u8 = 1;
const STD_SET_FEATURE: u8 = 3;
const STD_SET_ADDRESS: u8 = 5;
const STD_GET_DESCRIPTOR: u8 = 6;
const STD_GET_CONFIGURATION: u8 = 8;
const STD_SET_CONFIGURATION: u8 = 9;
const STD_GET_INTERFACE: u8 = 10;
const STD_SET_INTERFACE: u8 = 11;

const FEATURE_REMOTE_WAKEUP: u16 = 1;

// GetStatus(device) bits.
const STATUS_SELF_POWERED: u16 = 0x01;
const STATUS_REMOTE_WAKEUP: u16 = 0x02;

/// Where upload data comes from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadSource {
    /// The flash range in the upload block.
    Flash,
    /// The device information record; the upload block start is the
    /// byte offset into the serialized record.
    Info,
}

/// Which buffer the IN data stage in progress transmits from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxSource {
    Scratch,
    Transfer,
}

/// The USB interrupt half of the bootloader.
///
/// Owns the bus, the endpoint zero engine, the DFU class state machine
/// and the command parser. [`poll`](Self::poll) must be called from the
/// USB interrupt (or, bare-metal, a tight loop); deferred flash work is
/// picked up by the [`FlashScheduler`](crate::FlashScheduler) attached
/// to the same [`Shared`] exchange.
pub struct DfuDevice<'a, B: UsbBus, M: FlashReader> {
    pub(crate) bus: B,
    pub(crate) pipe: ControlPipe,
    pub(crate) shared: &'a Shared,
    pub(crate) reader: M,
    pub(crate) config: BootConfig,
    pub(crate) info: DeviceInfo,

    // standard device state
    pub(crate) configuration: u8,
    pub(crate) alt_setting: u8,
    pub(crate) remote_wakeup: bool,
    pub(crate) address_set: bool,

    // DFU class state machine
    pub(crate) state: DfuState,
    pub(crate) status: DfuStatus,
    pub(crate) next_upload: MemoryBlock,
    pub(crate) upload_source: UploadSource,
    pub(crate) suppress_header: bool,
    pub(crate) binary_mode: bool,
    pub(crate) last_command: u8,

    pub(crate) tx_source: TxSource,
    pub(crate) scratch: [u8; EP0_MAX_PACKET],
}

fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

impl<'a, B: UsbBus, M: FlashReader> DfuDevice<'a, B, M> {
    /// Takes ownership of the bus, claims endpoint zero and enables the
    /// device.
    pub fn new(mut bus: B, reader: M, shared: &'a Shared, config: BootConfig) -> Self {
        bus.alloc_ep(
            UsbDirection::Out,
            Some(EndpointAddress::from_parts(0, UsbDirection::Out)),
            EndpointType::Control,
            EP0_MAX_PACKET as u16,
            0,
        )
        .ok();
        bus.alloc_ep(
            UsbDirection::In,
            Some(EndpointAddress::from_parts(0, UsbDirection::In)),
            EndpointType::Control,
            EP0_MAX_PACKET as u16,
            0,
        )
        .ok();
        bus.enable();

        let info = DeviceInfo::new(&config);
        Self {
            bus,
            pipe: ControlPipe::new(),
            shared,
            reader,
            config,
            info,
            configuration: 1,
            alt_setting: 0,
            remote_wakeup: false,
            address_set: false,
            state: DfuState::Idle,
            status: DfuStatus::Ok,
            next_upload: config.app_region(),
            upload_source: UploadSource::Flash,
            suppress_header: false,
            binary_mode: false,
            last_command: 0,
            tx_source: TxSource::Scratch,
            scratch: [0; EP0_MAX_PACKET],
        }
    }

    /// Current DFU state.
    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Current DFU status.
    pub fn status(&self) -> DfuStatus {
        self.status
    }

    /// Services one bus event. Returns true when an event was handled.
    pub fn poll(&mut self) -> bool {
        match self.bus.poll() {
            PollResult::Reset => {
                self.handle_bus_reset();
                true
            }
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            } => {
                if ep_setup & 1 != 0 {
                    self.handle_setup();
                } else if ep_out & 1 != 0 {
                    self.handle_out();
                }
                if ep_in_complete & 1 != 0 {
                    self.handle_in_complete();
                }
                true
            }
            _ => false,
        }
    }

    /// The cable was unplugged; a following reset no longer belongs to
    /// an interrupted update session.
    pub fn handle_disconnect(&mut self) {
        self.address_set = false;
    }

    fn handle_bus_reset(&mut self) {
        // an unexpected reset mid-update reboots into a clean state
        if self.address_set
            && !matches!(
                self.state,
                DfuState::Idle | DfuState::DownloadSync | DfuState::DownloadIdle
            )
        {
            self.shared.flags.raise(CommandFlags::RESET);
        }
        self.bus.reset();
        self.pipe.reset();
        self.configuration = 1;
        self.alt_setting = 0;
        self.remote_wakeup = false;
    }

    fn handle_setup(&mut self) {
        let mut raw = [0u8; 8];
        let count = match self.bus.read(ep0_out(), &mut raw) {
            Ok(count) => count,
            Err(_) => return,
        };
        self.pipe.setup_received(&self.bus);
        if count != 8 {
            self.pipe.stall(&self.bus);
            return;
        }
        let req = SetupPacket::parse(&raw);
        if req.request_type == RequestType::Standard {
            self.handle_standard_request(req);
        } else {
            self.handle_class_request(req);
        }
    }

    fn handle_out(&mut self) {
        match self.pipe.state {
            Ep0State::Receiving => {
                // SAFETY: receiving download data, no write is staged
                // yet.
                let buf = unsafe { self.shared.transfer_buffer() };
                if let Some(total) = self.pipe.continue_rx(&self.bus, &mut buf[..]) {
                    self.pipe.acknowledge(&self.bus);
                    self.handle_ep0_data(total);
                }
            }
            // the status-stage handshake of an IN transfer
            Ep0State::Status | Ep0State::Idle => self.pipe.finish_status_out(&self.bus),
            _ => {}
        }
    }

    fn handle_in_complete(&mut self) {
        match self.pipe.state {
            Ep0State::Transmitting => self.continue_transmit(),
            Ep0State::Status => {
                if self.pipe.finish_status(&self.bus) {
                    self.address_latched();
                }
            }
            _ => {}
        }
    }

    fn continue_transmit(&mut self) {
        match self.tx_source {
            TxSource::Scratch => self.pipe.continue_tx(&self.bus, &self.scratch),
            TxSource::Transfer => {
                // SAFETY: the upload in progress owns the buffer.
                let buf = unsafe { self.shared.transfer_buffer() };
                self.pipe.continue_tx(&self.bus, buf);
            }
        }
    }

    /// Queues `length` scratch bytes for the IN data stage.
    pub(crate) fn tx_from_scratch(&mut self, length: usize) {
        self.tx_source = TxSource::Scratch;
        self.pipe.send_data(&self.bus, &self.scratch[..length]);
    }

    /// Enumeration completed: reset the DFU machine and the transfer
    /// ranges to their defaults.
    fn address_latched(&mut self) {
        self.address_set = true;
        self.state = DfuState::Idle;
        self.status = DfuStatus::Ok;
        self.reset_upload_range();
        self.shared.next_download.store(self.config.app_region());
        self.binary_mode = false;
        self.suppress_header = false;
    }

    fn handle_standard_request(&mut self, req: SetupPacket) {
        match req.request {
            STD_GET_STATUS => self.standard_get_status(req),
            STD_CLEAR_FEATURE => self.standard_feature(req, false),
            STD_SET_FEATURE => self.standard_feature(req, true),
            STD_SET_ADDRESS => {
                self.pipe.set_address_later(req.value as u8);
                self.pipe.acknowledge(&self.bus);
            }
            STD_GET_DESCRIPTOR => self.standard_get_descriptor(req),
            STD_GET_CONFIGURATION => {
                self.scratch[0] = if self.address_set {
                    self.configuration
                } else {
                    0
                };
                self.tx_from_scratch(1);
            }
            STD_SET_CONFIGURATION => {
                // a single configuration; selecting it (or none) resets
                // the DFU machine
                if req.value > 1 {
                    self.pipe.stall(&self.bus);
                } else {
                    self.configuration = req.value as u8;
                    self.state = DfuState::Idle;
                    self.status = DfuStatus::Ok;
                    self.pipe.acknowledge(&self.bus);
                }
            }
            STD_GET_INTERFACE => {
                if req.index == 0 {
                    self.scratch[0] = self.alt_setting;
                    self.tx_from_scratch(1);
                } else {
                    self.pipe.stall(&self.bus);
                }
            }
            STD_SET_INTERFACE => {
                // one interface, no alternates
                if req.index == 0 && req.value == 0 {
                    self.pipe.acknowledge(&self.bus);
                } else {
                    self.pipe.stall(&self.bus);
                }
            }
            // SetDescriptor, SynchFrame, unknown
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn standard_get_status(&mut self, req: SetupPacket) {
        let value: u16 = match req.recipient {
            Recipient::Device => {
                let mut bits = 0;
                if self.config.self_powered {
                    bits |= STATUS_SELF_POWERED;
                }
                if self.remote_wakeup {
                    bits |= STATUS_REMOTE_WAKEUP;
                }
                bits
            }
            Recipient::Interface => 0,
            // no endpoints beyond EP0
            _ => {
                self.pipe.stall(&self.bus);
                return;
            }
        };
        self.scratch[0..2].copy_from_slice(&value.to_le_bytes());
        self.tx_from_scratch(2);
    }

    fn standard_feature(&mut self, req: SetupPacket, set: bool) {
        if req.recipient == Recipient::Device && req.value == FEATURE_REMOTE_WAKEUP {
            self.remote_wakeup = set;
            self.pipe.acknowledge(&self.bus);
        } else {
            self.pipe.stall(&self.bus);
        }
    }

    fn standard_get_descriptor(&mut self, req: SetupPacket) {
        let kind = (req.value >> 8) as u8;
        let index = (req.value & 0xff) as u8;
        let length = match kind {
            descriptor::DESC_TYPE_DEVICE => {
                DeviceDescriptor::new(&self.config, EP0_MAX_PACKET as u8)
                    .write_to(&mut self.scratch)
            }
            descriptor::DESC_TYPE_CONFIGURATION if index == 0 => {
                descriptor::write_configuration(&self.config, &mut self.scratch)
            }
            descriptor::DESC_TYPE_STRING => {
                match descriptor::write_string(&self.config, index, req.index, &mut self.scratch) {
                    Some(length) => length,
                    None => {
                        self.pipe.stall(&self.bus);
                        return;
                    }
                }
            }
            _ => {
                self.pipe.stall(&self.bus);
                return;
            }
        };
        let length = min(length, req.length as usize);
        self.tx_from_scratch(length);
    }
}
