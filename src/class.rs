//! Class handlers
//!
//! A [`Class`] implements the device's function above chapter 9: class and
//! vendor control requests, class descriptors, and the data moved on the
//! non-zero endpoints. All methods run in the dispatch context, and have
//! defaults that do nothing or reject.

use crate::{
    descriptor::Configuration,
    endpoint::{Endpoint, Endpoints},
    phy::Transceiver,
    setup::SetupPacket,
    state::DeviceState,
};
use usb_device::{endpoint::EndpointAddress, UsbError};

/// Device function callbacks
pub trait Class {
    /// The bus was reset, and every endpoint was removed
    fn reset(&mut self) {}

    /// USB power changed
    fn power(&mut self, powered: bool) {
        let _ = powered;
    }

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    /// Start of frame, when enabled with [`Device::set_sof_enabled`](crate::Device::set_sof_enabled)
    fn start_of_frame(&mut self, frame: u16) {
        let _ = frame;
    }

    /// The device moved to a new [`DeviceState`]
    fn state_changed(&mut self, state: DeviceState) {
        let _ = state;
    }

    /// Handle a class or vendor IN request, or an interface GET_DESCRIPTOR
    ///
    /// Write the response into `buffer` and return its length. The engine
    /// sends at most `wLength` bytes. Return `None` to stall.
    fn control_in(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> Option<usize> {
        let _ = (setup, buffer);
        None
    }

    /// Handle a class or vendor OUT request
    ///
    /// Called after the data stage, with the data the host sent. Return
    /// `false` to stall the status stage.
    fn control_out(&mut self, setup: &SetupPacket, data: &[u8]) -> bool {
        let _ = (setup, data);
        false
    }

    /// The host selected a configuration, or deconfigured the device
    ///
    /// The configuration's default endpoints are already added. OUT
    /// endpoints don't receive until you start a read.
    fn configured<P: Transceiver>(
        &mut self,
        io: &mut EndpointIo<'_, P>,
        configuration: Option<Configuration<'_>>,
    ) {
        let _ = (io, configuration);
    }

    /// The host selected an alternate setting
    fn interface_changed<P: Transceiver>(
        &mut self,
        io: &mut EndpointIo<'_, P>,
        interface: u8,
        alternate: u8,
    ) {
        let _ = (io, interface, alternate);
    }

    /// An IN transfer completed
    fn endpoint_in<P: Transceiver>(&mut self, io: &mut EndpointIo<'_, P>, address: EndpointAddress) {
        let _ = (io, address);
    }

    /// An OUT transfer completed; collect it with [`EndpointIo::read_result`]
    fn endpoint_out<P: Transceiver>(&mut self, io: &mut EndpointIo<'_, P>, address: EndpointAddress) {
        let _ = (io, address);
    }
}

/// A device without a function
impl Class for () {}

/// Transfers on the non-zero endpoints
///
/// Handed to [`Class`] callbacks, and available from
/// [`Device::endpoints`](crate::Device::endpoints). Transfers are only
/// allowed while the device is configured.
pub struct EndpointIo<'a, P> {
    phy: &'a mut P,
    endpoints: &'a mut Endpoints,
    configured: bool,
}

impl<'a, P: Transceiver> EndpointIo<'a, P> {
    pub(crate) fn new(phy: &'a mut P, endpoints: &'a mut Endpoints, configured: bool) -> Self {
        EndpointIo {
            phy,
            endpoints,
            configured,
        }
    }

    fn check_configured(&self) -> Result<(), UsbError> {
        if self.configured {
            Ok(())
        } else {
            Err(UsbError::InvalidState)
        }
    }

    /// Returns `true` if the device is configured
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn endpoint(&self, address: EndpointAddress) -> Option<&Endpoint> {
        self.endpoints.get(address)
    }

    pub fn max_packet(&self, address: EndpointAddress) -> Option<u16> {
        self.endpoint(address).map(Endpoint::max_packet)
    }

    pub fn is_halted(&self, address: EndpointAddress) -> bool {
        self.endpoint(address).map_or(false, Endpoint::is_halted)
    }

    /// Start sending one packet on an IN endpoint
    ///
    /// Returns `WouldBlock` while the previous write is in flight.
    pub fn write(&mut self, address: EndpointAddress, buffer: &[u8]) -> Result<usize, UsbError> {
        self.check_configured()?;
        self.endpoints.start_write(self.phy, address, buffer)
    }

    /// Start receiving one packet on an OUT endpoint
    pub fn read(&mut self, address: EndpointAddress) -> Result<(), UsbError> {
        self.check_configured()?;
        self.endpoints.start_read(self.phy, address)
    }

    /// Copy out the packet of a completed read
    ///
    /// `buffer` must hold at least the endpoint's max packet size.
    pub fn read_result(
        &mut self,
        address: EndpointAddress,
        buffer: &mut [u8],
    ) -> Result<usize, UsbError> {
        self.check_configured()?;
        self.endpoints.read_result(self.phy, address, buffer)
    }

    /// Halt an endpoint, as SET_FEATURE(ENDPOINT_HALT) would
    pub fn stall(&mut self, address: EndpointAddress) -> Result<(), UsbError> {
        self.check_configured()?;
        self.endpoints.stall(self.phy, address)
    }

    /// Clear an endpoint halt, and reset its data toggle
    pub fn unstall(&mut self, address: EndpointAddress) -> Result<(), UsbError> {
        self.check_configured()?;
        self.endpoints.unstall(self.phy, address)
    }
}
