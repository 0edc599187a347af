//! Control transfers on endpoint zero
//!
//! The pipe moves one request at a time through its stages:
//!
//! ```text
//! Idle -> SETUP -> DataIn  -> StatusOut -> Idle
//!               -> DataOut -> StatusIn  -> Idle
//!               -> StatusIn -> Idle
//! ```
//!
//! A SETUP packet discards whatever transfer was in progress. A rejected
//! request stalls endpoint zero, and the transceiver clears that stall on
//! the next SETUP.

use crate::{phy::Transceiver, setup::SetupPacket};
use usb_device::UsbDirection;

/// Control transfer stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// No transfer in progress
    Idle,
    /// Sending data to the host
    DataIn,
    /// Receiving data from the host
    DataOut,
    /// Sending the zero-length status packet
    StatusIn,
    /// Waiting for the host's zero-length status packet
    StatusOut,
}

/// How a request handler answers a SETUP packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response<'d> {
    /// Stall the request
    Reject,
    /// Complete the request without data
    Accept,
    /// Complete the request, then apply the address after the status stage
    SetAddress(u8),
    /// Send the first `n` bytes of the control buffer
    Data(usize),
    /// Send bytes that outlive the transfer, like a configuration descriptor
    Static(&'d [u8]),
    /// Receive the host's data into the control buffer
    Receive,
}

/// Where IN data comes from
#[derive(Clone, Copy)]
enum Source<'d> {
    Buffer,
    Static(&'d [u8]),
}

/// An endpoint zero completion that the device needs to act on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The OUT data stage finished; call [`ControlPipe::finish_out`]
    DataReceived,
    /// The status stage of SET_ADDRESS finished
    Address(u8),
}

/// Endpoint zero transfer context
pub struct ControlPipe<'d, const SIZE: usize> {
    buffer: [u8; SIZE],
    stage: Stage,
    setup: Option<SetupPacket>,
    source: Source<'d>,
    /// Bytes sent or received so far
    position: usize,
    /// Bytes to send or receive
    total: usize,
    /// Terminate the IN data stage with a zero-length packet
    zlp: bool,
    /// An `ep0_write` is waiting for its completion
    writing: bool,
    address: Option<u8>,
    max_packet: usize,
}

impl<'d, const SIZE: usize> ControlPipe<'d, SIZE> {
    pub const fn new() -> Self {
        ControlPipe {
            buffer: [0; SIZE],
            stage: Stage::Idle,
            setup: None,
            source: Source::Buffer,
            position: 0,
            total: 0,
            zlp: false,
            writing: false,
            address: None,
            max_packet: 64,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The request being handled
    pub fn setup(&self) -> Option<&SetupPacket> {
        self.setup.as_ref()
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    /// Use the endpoint zero packet size granted by the transceiver
    pub fn set_max_packet(&mut self, max_packet: u16) {
        self.max_packet = usize::from(max_packet).max(1);
    }

    /// The whole control buffer, for handlers to fill with IN data
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Data received by the OUT data stage
    pub fn received(&self) -> &[u8] {
        &self.buffer[..self.position.min(SIZE)]
    }

    /// Discard the transfer in progress
    ///
    /// Used for bus resets and power loss. The transceiver has already
    /// dropped any packets in flight.
    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.setup = None;
        self.source = Source::Buffer;
        self.position = 0;
        self.total = 0;
        self.zlp = false;
        self.writing = false;
        self.address = None;
    }

    /// A SETUP packet arrived; start a new transfer
    pub fn begin(&mut self, setup: SetupPacket) {
        if self.stage != Stage::Idle {
            debug!("SETUP PREEMPTS {:?}", self.stage);
        }
        self.reset();
        self.setup = Some(setup);
    }

    /// Stall endpoint zero and drop the transfer
    pub fn stall<P: Transceiver>(&mut self, phy: &mut P) {
        phy.ep0_stall();
        self.stage = Stage::Idle;
        self.writing = false;
        self.address = None;
    }

    /// Act on a handler's response to the current SETUP packet
    pub fn respond<P: Transceiver>(&mut self, phy: &mut P, response: Response<'d>) {
        let Some(setup) = self.setup else {
            warn!("RESPONSE WITHOUT SETUP");
            return;
        };
        let length = setup.length as usize;

        let response = match (setup.direction, response) {
            (UsbDirection::In, Response::Accept) if length > 0 => Response::Data(0),
            (_, response) => response,
        };

        match response {
            Response::Reject => {
                debug!("STALL REQUEST {:#X}", setup.request);
                self.stall(phy)
            }
            Response::Accept | Response::SetAddress(_) | Response::Receive if length == 0 => {
                if let Response::SetAddress(address) = response {
                    self.address = Some(address);
                }
                self.status_in(phy);
            }
            Response::Data(_) | Response::Static(_) if setup.direction == UsbDirection::Out => {
                warn!("IN DATA FOR OUT REQUEST {:#X}", setup.request);
                self.stall(phy);
            }
            Response::Data(_) | Response::Static(_) if length == 0 => self.status_in(phy),
            Response::Data(len) => {
                self.source = Source::Buffer;
                self.start_in(phy, len.min(SIZE), length);
            }
            Response::Static(bytes) => {
                self.source = Source::Static(bytes);
                self.start_in(phy, bytes.len(), length);
            }
            Response::Receive if setup.direction == UsbDirection::In || length > SIZE => {
                warn!("CANNOT RECEIVE {} BYTES", length);
                self.stall(phy);
            }
            Response::Receive => {
                self.total = length;
                self.position = 0;
                self.stage = Stage::DataOut;
                phy.ep0_read();
            }
            // Accept and SetAddress for a request that sends data.
            Response::Accept | Response::SetAddress(_) => {
                warn!("UNEXPECTED DATA STAGE FOR {:#X}", setup.request);
                self.stall(phy);
            }
        }
    }

    /// Start the IN data stage
    fn start_in<P: Transceiver>(&mut self, phy: &mut P, available: usize, requested: usize) {
        self.total = available.min(requested);
        self.position = 0;
        // A short packet ends the stage. When the data ends on a packet
        // boundary before the host's limit, only a zero-length packet is short.
        self.zlp = self.total < requested && self.total % self.max_packet == 0;
        self.write_next(phy);
    }

    /// Write the next IN data packet
    ///
    /// The status OUT stage is armed together with the last packet, so a
    /// dropped ACK for that packet can't wedge the transfer.
    fn write_next<P: Transceiver>(&mut self, phy: &mut P) {
        let data = match self.source {
            Source::Buffer => &self.buffer[..self.total],
            Source::Static(bytes) => &bytes[..self.total],
        };
        let chunk = (self.total - self.position).min(self.max_packet);
        phy.ep0_write(&data[self.position..self.position + chunk]);
        self.writing = true;
        self.position += chunk;

        if self.position == self.total && (chunk < self.max_packet || !self.zlp) {
            self.zlp = false;
            self.stage = Stage::StatusOut;
            phy.ep0_read();
        } else {
            self.stage = Stage::DataIn;
        }
    }

    fn status_in<P: Transceiver>(&mut self, phy: &mut P) {
        self.stage = Stage::StatusIn;
        self.writing = true;
        phy.ep0_write(&[]);
    }

    /// Finish an OUT data stage
    ///
    /// `accepted` is the handler's verdict on the received data.
    pub fn finish_out<P: Transceiver>(&mut self, phy: &mut P, accepted: bool) {
        if self.stage != Stage::DataOut {
            return;
        }
        if accepted {
            self.status_in(phy);
        } else {
            debug!("STALL OUT DATA");
            self.stall(phy);
        }
    }

    /// Endpoint zero IN completion
    pub fn in_complete<P: Transceiver>(&mut self, phy: &mut P) -> Option<Completion> {
        if !self.writing {
            warn!("STALE EP0 IN IN {:?}", self.stage);
            return None;
        }
        self.writing = false;
        match self.stage {
            Stage::DataIn => {
                self.write_next(phy);
                None
            }
            Stage::StatusIn => {
                self.stage = Stage::Idle;
                self.address.take().map(Completion::Address)
            }
            // The last data packet; the status stage is already armed.
            Stage::StatusOut => None,
            Stage::Idle | Stage::DataOut => {
                warn!("STALE EP0 IN IN {:?}", self.stage);
                None
            }
        }
    }

    /// Endpoint zero OUT completion
    pub fn out_complete<P: Transceiver>(&mut self, phy: &mut P) -> Option<Completion> {
        match self.stage {
            Stage::DataOut => {
                let end = self.total;
                let received = phy.ep0_read_result(&mut self.buffer[self.position..end]);
                self.position += received;
                if self.position >= self.total || received < self.max_packet {
                    Some(Completion::DataReceived)
                } else {
                    phy.ep0_read();
                    None
                }
            }
            Stage::StatusOut => {
                phy.ep0_read_result(&mut []);
                self.stage = Stage::Idle;
                None
            }
            _ => {
                warn!("STALE EP0 OUT IN {:?}", self.stage);
                None
            }
        }
    }
}
