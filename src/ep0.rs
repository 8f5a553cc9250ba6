//! Endpoint zero control transfer engine.
//!
//! [`ControlPipe`] tracks the stage of the current control transfer and
//! moves data in maximum-packet-size chunks. It owns no buffers; the
//! caller passes the source or destination slice on every call, which
//! lets request handlers transmit either from a small scratch area or
//! from the shared transfer buffer.

use core::cmp::min;

use usb_device::bus::UsbBus;
use usb_device::control::{Recipient, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// Maximum packet size of endpoint zero.
pub const EP0_MAX_PACKET: usize = 64;

/// Stage of the control transfer in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub(crate) enum Ep0State {
    /// No transfer in progress.
    Idle,
    /// IN data stage, more chunks to send.
    Transmitting,
    /// OUT data stage, more chunks expected.
    Receiving,
    /// Waiting for the host to acknowledge the status stage.
    Status,
    /// Both directions stalled until the next SETUP packet.
    Stalled,
}

/// A parsed 8-byte SETUP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    /// Data stage direction.
    pub direction: UsbDirection,
    /// Standard, class or vendor request.
    pub request_type: RequestType,
    /// Addressed entity.
    pub recipient: Recipient,
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
    /// wLength: exact OUT data length, maximum IN data length.
    pub length: u16,
}

impl SetupPacket {
    pub(crate) fn parse(raw: &[u8; 8]) -> Self {
        let rt = raw[0];
        Self {
            direction: if rt & 0x80 != 0 {
                UsbDirection::In
            } else {
                UsbDirection::Out
            },
            request_type: match (rt >> 5) & 0x03 {
                0 => RequestType::Standard,
                1 => RequestType::Class,
                2 => RequestType::Vendor,
                _ => RequestType::Reserved,
            },
            recipient: match rt & 0x1f {
                0 => Recipient::Device,
                1 => Recipient::Interface,
                2 => Recipient::Endpoint,
                3 => Recipient::Other,
                _ => Recipient::Reserved,
            },
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }
}

pub(crate) struct ControlPipe {
    pub(crate) state: Ep0State,
    tx_pos: usize,
    tx_len: usize,
    rx_pos: usize,
    rx_len: usize,
    pending_address: Option<u8>,
}

fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

impl ControlPipe {
    pub fn new() -> Self {
        Self {
            state: Ep0State::Idle,
            tx_pos: 0,
            tx_len: 0,
            rx_pos: 0,
            rx_len: 0,
            pending_address: None,
        }
    }

    /// Returns the engine to its post-reset state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Queues `data` for the IN data stage and sends the first chunk.
    ///
    /// The caller must pass a slice at least as long on every
    /// [`continue_tx`](Self::continue_tx) call until the stage
    /// completes.
    pub fn send_data<B: UsbBus>(&mut self, bus: &B, data: &[u8]) {
        self.tx_pos = 0;
        self.tx_len = data.len();
        self.state = Ep0State::Transmitting;
        self.continue_tx(bus, data);
    }

    /// Sends the next IN chunk from `data`.
    ///
    /// A full-size chunk keeps the stage open so that a trailing zero
    /// length packet terminates transfers that end on a packet boundary.
    /// A short chunk moves to the status stage.
    pub fn continue_tx<B: UsbBus>(&mut self, bus: &B, data: &[u8]) {
        let remaining = self.tx_len - self.tx_pos;
        let chunk = min(remaining, EP0_MAX_PACKET);
        bus.write(ep0_in(), &data[self.tx_pos..self.tx_pos + chunk]).ok();
        self.tx_pos += chunk;
        if chunk < EP0_MAX_PACKET {
            self.state = Ep0State::Status;
        }
    }

    /// Arms the OUT data stage for `length` bytes. Does nothing when
    /// `length` is zero.
    pub fn request_data(&mut self, length: usize) {
        if length == 0 {
            return;
        }
        self.rx_pos = 0;
        self.rx_len = length;
        self.state = Ep0State::Receiving;
    }

    /// Reads the next OUT chunk into `buf`.
    ///
    /// Returns the total received length once the expected byte count
    /// has arrived or the host sent a short packet.
    pub fn continue_rx<B: UsbBus>(&mut self, bus: &B, buf: &mut [u8]) -> Option<usize> {
        let remaining = self.rx_len - self.rx_pos;
        let chunk = min(remaining, EP0_MAX_PACKET);
        match bus.read(ep0_out(), &mut buf[self.rx_pos..self.rx_pos + chunk]) {
            Ok(count) => {
                self.rx_pos += count;
                if self.rx_pos >= self.rx_len || count < EP0_MAX_PACKET {
                    Some(self.rx_pos)
                } else {
                    None
                }
            }
            Err(_) => None,
        }
    }

    /// Completes a request without an IN data stage by queueing the
    /// zero length status handshake.
    pub fn acknowledge<B: UsbBus>(&mut self, bus: &B) {
        bus.write(ep0_in(), &[]).ok();
        self.state = Ep0State::Status;
    }

    /// Protocol stall. Both directions stay stalled until the host
    /// observes the condition and sends a new SETUP packet.
    pub fn stall<B: UsbBus>(&mut self, bus: &B) {
        bus.set_stalled(ep0_in(), true);
        bus.set_stalled(ep0_out(), true);
        self.state = Ep0State::Stalled;
    }

    /// A new SETUP packet arrived: clear a pending stall and abandon
    /// whatever transfer was in progress.
    pub fn setup_received<B: UsbBus>(&mut self, bus: &B) {
        if self.state == Ep0State::Stalled {
            bus.set_stalled(ep0_in(), false);
            bus.set_stalled(ep0_out(), false);
        }
        self.state = Ep0State::Idle;
    }

    /// Defers a SetAddress until the status stage completes, as the
    /// request is acknowledged at the old address.
    pub fn set_address_later(&mut self, address: u8) {
        self.pending_address = Some(address);
    }

    /// The host's zero length status-stage packet following an IN data
    /// stage. Some buses report it as an OUT completion; consume it and
    /// finish the transfer.
    pub fn finish_status_out<B: UsbBus>(&mut self, bus: &B) {
        let mut zlp = [0u8; EP0_MAX_PACKET];
        bus.read(ep0_out(), &mut zlp).ok();
        self.state = Ep0State::Idle;
    }

    /// The host acknowledged the status stage. Latches a deferred
    /// device address; returns true when one was applied.
    pub fn finish_status<B: UsbBus>(&mut self, bus: &B) -> bool {
        self.state = Ep0State::Idle;
        if let Some(address) = self.pending_address.take() {
            bus.set_device_address(address);
            return true;
        }
        false
    }
}
