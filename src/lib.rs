//! A device-side USB 2.0 protocol engine
//!
//! `usbd-engine` implements the chapter 9 device framework above an abstract
//! [`Transceiver`]: device states, enumeration, control transfers on endpoint
//! zero, and endpoint management for the non-zero endpoints. It's portable
//! across USB controllers, and it doesn't allocate.
//!
//! You provide
//!
//! - a [`Transceiver`] implementation for your USB hardware,
//! - the device's [`Descriptors`](descriptor::Descriptors), and
//! - a [`Class`] that implements the device's function.
//!
//! Then call [`Device::process`] whenever the transceiver signals an event,
//! usually from the USB interrupt. [`SharedDevice`] shares a device between
//! the interrupt and the rest of your program.
//!
//! # Example
//!
//! ```no_run
//! use usbd_engine::{
//!     descriptor::{DeviceDescriptor, Descriptors, StringSet},
//!     Device, Transceiver,
//! };
//! use usb_device::endpoint::{EndpointAddress, EndpointType};
//!
//! # struct Phy;
//! # impl Transceiver for Phy {
//! #     fn init(&mut self) {}
//! #     fn deinit(&mut self) {}
//! #     fn powered(&self) -> bool { true }
//! #     fn connect(&mut self) {}
//! #     fn disconnect(&mut self) {}
//! #     fn configure(&mut self) {}
//! #     fn unconfigure(&mut self) {}
//! #     fn sof_enable(&mut self) {}
//! #     fn sof_disable(&mut self) {}
//! #     fn set_address(&mut self, _: u8) {}
//! #     fn remote_wakeup(&mut self) {}
//! #     fn endpoint_table(&self) -> &usbd_engine::EndpointTable { unimplemented!() }
//! #     fn ep0_set_max_packet(&mut self, mps: u16) -> u16 { mps }
//! #     fn ep0_setup_read_result(&mut self) -> [u8; 8] { [0; 8] }
//! #     fn ep0_read(&mut self) {}
//! #     fn ep0_read_result(&mut self, _: &mut [u8]) -> usize { 0 }
//! #     fn ep0_write(&mut self, _: &[u8]) {}
//! #     fn ep0_stall(&mut self) {}
//! #     fn endpoint_add(&mut self, _: EndpointAddress, _: u16, _: EndpointType) -> bool { true }
//! #     fn endpoint_remove(&mut self, _: EndpointAddress) {}
//! #     fn endpoint_stall(&mut self, _: EndpointAddress) {}
//! #     fn endpoint_unstall(&mut self, _: EndpointAddress) {}
//! #     fn endpoint_read(&mut self, _: EndpointAddress, _: usize) -> bool { true }
//! #     fn endpoint_read_result(&mut self, _: EndpointAddress, _: &mut [u8]) -> usize { 0 }
//! #     fn endpoint_write(&mut self, _: EndpointAddress, _: &[u8]) -> bool { true }
//! #     fn endpoint_abort(&mut self, _: EndpointAddress) {}
//! #     fn process(&mut self) -> usbd_engine::Events { usbd_engine::Events::none() }
//! # }
//! // Build these with ConfigurationWriter, or write them out.
//! #[rustfmt::skip]
//! static CONFIGURATION: [u8; 32] = [
//!     9, 2, 32, 0, 1, 1, 0, 0x80, 50,
//!     9, 4, 0, 0, 2, 0xFF, 0, 0, 0,
//!     7, 5, 0x81, 2, 64, 0, 0,
//!     7, 5, 0x01, 2, 64, 0, 0,
//! ];
//! static CONFIGURATIONS: [&[u8]; 1] = [&CONFIGURATION];
//! static STRINGS: [StringSet; 1] = [StringSet::new(0x0409, &["Acme", "Widget"])];
//!
//! let device_descriptor = DeviceDescriptor::new(0x1209, 0x0001).manufacturer(1).product(2);
//! let descriptors = Descriptors::new(device_descriptor, &CONFIGURATIONS, &STRINGS).unwrap();
//!
//! let mut device: Device<'_, Phy> = Device::new(Phy, descriptors);
//! device.init();
//! device.connect().unwrap();
//!
//! // In the USB interrupt:
//! device.process(&mut ());
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;

mod class;
mod control;
pub mod descriptor;
mod device;
mod endpoint;
mod phy;
mod setup;
mod shared;
mod standard;
mod state;

#[cfg(test)]
mod testing;

pub use class::{Class, EndpointIo};
pub use control::{Response, Stage};
pub use device::{
    Deferred, DeferredConsumer, DeferredProducer, DeferredQueue, Device, Requests,
    DEFERRED_CAPACITY,
};
pub use endpoint::Endpoint;
pub use phy::{
    EndpointAttributes, EndpointCapability, EndpointTable, EventFlags, Events, Transceiver,
    ENDPOINT_NUMBERS,
};
pub use setup::{Request, SetupPacket};
pub use shared::SharedDevice;
pub use standard::RequestError;
pub use state::DeviceState;

/// Default capacity of the control transfer buffer
pub const CONTROL_BUFFER_SIZE: usize = 256;

/// Minimum time between a disconnect and the next connect, in microseconds
///
/// Hosts may miss shorter detaches.
pub const MIN_DISCONNECT_TIME_US: u32 = 1000;

/// Interfaces tracked per configuration
///
/// Alternate settings of interfaces at or beyond this number are rejected.
pub const MAX_INTERFACES: usize = 32;
