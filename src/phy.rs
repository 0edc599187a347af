//! The transceiver contract
//!
//! A [`Transceiver`] is the chip-specific half of a USB device: it programs
//! registers, moves packets between hardware buffers and memory, and reports
//! hardware events. The engine owns a transceiver and drives it from a single
//! dispatch context.
//!
//! # Defined behavior
//!
//! - Any endpoint configuration that fits in the [`EndpointTable`] returned
//!   by [`endpoint_table()`](Transceiver::endpoint_table) can be used, and all
//!   endpoints of a valid configuration can be used concurrently.
//! - Events are only reported while the transceiver is initialized. While
//!   unpowered, only [`EventFlags::POWER`] may be reported.
//! - On a bus reset, the transceiver removes all endpoints except endpoint zero.
//! - IN and OUT completions only occur for endpoints which have been added.
//! - A call to [`ep0_write()`](Transceiver::ep0_write) results in an
//!   [`EventFlags::EP0_IN`] completion unless interrupted by a power loss or reset.
//!   The same holds for `ep0_read` and [`EventFlags::EP0_OUT`], and for the
//!   non-zero endpoint reads and writes.
//! - Endpoint zero NAKs all transactions aside from SETUP packets until one of
//!   `ep0_read`, `ep0_write` or `ep0_stall` is called.
//! - An endpoint zero stall is cleared automatically when a SETUP packet arrives.
//!
//! # Undefined behavior
//!
//! - Calling `endpoint_add` or `endpoint_remove` outside of SET_CONFIGURATION
//!   or SET_INTERFACE processing. The engine never does this.
//! - Calling any `endpoint_*` method on endpoint zero.
//! - Asserting `connect` again less than [`MIN_DISCONNECT_TIME_US`](crate::MIN_DISCONNECT_TIME_US)
//!   after `disconnect`. The host may not notice the detach.
//!
//! Reads and writes are asynchronous. The transceiver copies packet data
//! between its own buffers and the caller's slices, so no caller memory is
//! borrowed across a transfer.

use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Number of endpoint numbers, including endpoint zero
pub const ENDPOINT_NUMBERS: usize = 16;

bitflags::bitflags! {
    /// Events collected by one [`Transceiver::process`] pass
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventFlags: u16 {
        /// USB power changed; see [`Events::powered`]
        const POWER = 1 << 0;
        /// Bus reset
        const RESET = 1 << 1;
        /// The bus has been idle long enough to suspend
        const SUSPEND = 1 << 2;
        /// Bus activity after a suspend
        const RESUME = 1 << 3;
        /// Start-of-frame; see [`Events::frame`]
        const SOF = 1 << 4;
        /// A SETUP packet is ready for `ep0_setup_read_result`
        const EP0_SETUP = 1 << 5;
        /// The last `ep0_write` completed
        const EP0_IN = 1 << 6;
        /// The last `ep0_read` completed
        const EP0_OUT = 1 << 7;
    }
}

/// One dispatch pass worth of hardware events
///
/// A transceiver accumulates events between `process()` calls. The engine
/// handles them in a fixed order, so that endpoint zero IN completions are
/// always handled before endpoint zero OUT completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Events {
    pub flags: EventFlags,
    /// The new power state, meaningful when `POWER` is set
    pub powered: bool,
    /// The frame number, meaningful when `SOF` is set
    pub frame: u16,
    /// Bit `n` is set when an IN transfer completed on endpoint `n`
    pub ep_in: u16,
    /// Bit `n` is set when an OUT transfer completed on endpoint `n`
    pub ep_out: u16,
}

impl Events {
    /// No events
    pub const fn none() -> Self {
        Events {
            flags: EventFlags::empty(),
            powered: false,
            frame: 0,
            ep_in: 0,
            ep_out: 0,
        }
    }

    /// Returns `true` if nothing happened
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.ep_in == 0 && self.ep_out == 0
    }
}

bitflags::bitflags! {
    /// What an endpoint number supports
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EndpointAttributes: u8 {
        const CONTROL = 1 << 0;
        const BULK = 1 << 1;
        const INTERRUPT = 1 << 2;
        const ISOCHRONOUS = 1 << 3;
        /// Usable as an IN endpoint
        const IN = 1 << 4;
        /// Usable as an OUT endpoint
        const OUT = 1 << 5;
        /// IN and OUT may be used at the same time. Without this flag,
        /// the endpoint number supports one direction at a time.
        const SIMULTANEOUS = 1 << 6;
    }
}

/// Capability and resource cost of one endpoint number
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointCapability {
    pub attributes: EndpointAttributes,
    /// Fixed cost of using this endpoint
    pub base_cost: u8,
    /// Cost per byte of max packet size
    pub byte_cost: u8,
}

impl EndpointCapability {
    /// An endpoint number that can't be used
    pub const fn unavailable() -> Self {
        Self::new(EndpointAttributes::empty(), 0, 0)
    }

    pub const fn new(attributes: EndpointAttributes, base_cost: u8, byte_cost: u8) -> Self {
        EndpointCapability {
            attributes,
            base_cost,
            byte_cost,
        }
    }

    /// Returns `true` if the transfer type and direction are supported
    pub fn allows(&self, kind: EndpointType, direction: UsbDirection) -> bool {
        let kind = match kind {
            EndpointType::Control => EndpointAttributes::CONTROL,
            EndpointType::Bulk => EndpointAttributes::BULK,
            EndpointType::Interrupt => EndpointAttributes::INTERRUPT,
            EndpointType::Isochronous { .. } => EndpointAttributes::ISOCHRONOUS,
        };
        let direction = match direction {
            UsbDirection::In => EndpointAttributes::IN,
            UsbDirection::Out => EndpointAttributes::OUT,
        };
        self.attributes.contains(kind | direction)
    }

    /// The resources consumed by an endpoint with this max packet size
    pub fn cost(&self, max_packet: u16) -> u32 {
        u32::from(self.base_cost) + u32::from(self.byte_cost) * u32::from(max_packet)
    }
}

/// Describes which endpoints can be used, and what they cost
///
/// Entry `n` describes endpoint number `n`. Entry zero describes the
/// control endpoint, and it's never charged against `resources`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointTable {
    /// Total resources available to non-zero endpoints
    pub resources: u32,
    pub endpoints: [EndpointCapability; ENDPOINT_NUMBERS],
}

impl EndpointTable {
    /// Capability of the endpoint number at `address`
    pub fn capability(&self, address: EndpointAddress) -> &EndpointCapability {
        &self.endpoints[address.index() % ENDPOINT_NUMBERS]
    }
}

/// Abstract interface to the physical USB hardware
///
/// Implement this once per target. The engine is generic over the
/// implementation, so dispatch is resolved at build time.
pub trait Transceiver {
    /// Initialize the hardware and start collecting events
    ///
    /// Must be called before any other method, unless noted.
    fn init(&mut self);

    /// Disable interrupts and stop collecting events
    fn deinit(&mut self);

    /// Returns `true` if USB power is present
    ///
    /// Hardware that can't sense VBUS always returns `true`.
    fn powered(&self) -> bool;

    /// Enable the D+ or D- pull-up so the host can see the device
    fn connect(&mut self);

    /// Disable the pull-ups and stop responding to traffic
    fn disconnect(&mut self);

    /// Enter the configured state, enabling all added endpoints
    fn configure(&mut self);

    /// Leave the configured state; the hardware may disable all
    /// endpoints other than endpoint zero
    fn unconfigure(&mut self);

    /// Start reporting [`EventFlags::SOF`]
    fn sof_enable(&mut self);

    /// Stop reporting [`EventFlags::SOF`]
    fn sof_disable(&mut self);

    /// Set the device's bus address
    fn set_address(&mut self, address: u8);

    /// Signal remote wakeup to the host
    fn remote_wakeup(&mut self);

    /// The endpoint capability and cost table
    fn endpoint_table(&self) -> &EndpointTable;

    /// Request an endpoint zero max packet size, returning the size granted
    fn ep0_set_max_packet(&mut self, max_packet: u16) -> u16;

    /// Read the most recent SETUP packet
    fn ep0_setup_read_result(&mut self) -> [u8; 8];

    /// Start receiving one packet of up to the endpoint zero max packet size
    fn ep0_read(&mut self);

    /// Copy the packet received by the last `ep0_read` into `buffer`
    ///
    /// Returns the number of bytes copied.
    fn ep0_read_result(&mut self, buffer: &mut [u8]) -> usize;

    /// Start sending one packet on endpoint zero
    ///
    /// `buffer` is never larger than the granted max packet size. An empty
    /// buffer sends a zero-length packet.
    fn ep0_write(&mut self, buffer: &[u8]);

    /// Protocol stall on endpoint zero, until the next SETUP packet
    fn ep0_stall(&mut self);

    /// Configure and enable a non-zero endpoint
    ///
    /// Returns `false` if the hardware can't support the endpoint.
    fn endpoint_add(&mut self, address: EndpointAddress, max_packet: u16, kind: EndpointType)
        -> bool;

    /// Disable a non-zero endpoint
    fn endpoint_remove(&mut self, address: EndpointAddress);

    /// Set the halt feature on an endpoint
    fn endpoint_stall(&mut self, address: EndpointAddress);

    /// Clear the halt feature on an endpoint and reset its data toggle
    fn endpoint_unstall(&mut self, address: EndpointAddress);

    /// Start receiving up to `size` bytes on an OUT endpoint
    ///
    /// Returns `false` if the read could not be started.
    fn endpoint_read(&mut self, address: EndpointAddress, size: usize) -> bool;

    /// Copy the data received by the last `endpoint_read` into `buffer`
    fn endpoint_read_result(&mut self, address: EndpointAddress, buffer: &mut [u8]) -> usize;

    /// Start sending `buffer` on an IN endpoint
    ///
    /// Returns `false` if the write could not be started.
    fn endpoint_write(&mut self, address: EndpointAddress, buffer: &[u8]) -> bool;

    /// Abort a transfer that has not yet completed
    fn endpoint_abort(&mut self, address: EndpointAddress);

    /// Collect the hardware events that occurred since the last call
    fn process(&mut self) -> Events;
}
