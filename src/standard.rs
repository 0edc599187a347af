//! Standard requests
//!
//! Interprets chapter 9 requests against the device state, the endpoint
//! table and the descriptors. Requests that are malformed, or illegal in the
//! current state, produce a [`RequestError`], which the device answers with a
//! stall.

use crate::{
    class::{Class, EndpointIo},
    control::Response,
    descriptor::{descriptor_type, Configuration, Descriptors},
    endpoint::Endpoints,
    phy::Transceiver,
    setup::{Request, SetupPacket},
    state::{DeviceState, StateMachine},
};
use usb_device::{control::Recipient, endpoint::EndpointAddress, UsbDirection, UsbError};

/// Why a request was stalled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// Unknown request, or a recipient that doesn't take this request
    Unsupported,
    /// The request isn't allowed in the device's current state
    InvalidState,
    /// The request names a configuration, interface, endpoint or
    /// descriptor that doesn't exist
    InvalidValue,
    /// The endpoints of a configuration or alternate setting don't fit
    Resources(UsbError),
}

/// Everything a standard request may read or change
pub(crate) struct Context<'a, 'd, P> {
    pub phy: &'a mut P,
    pub endpoints: &'a mut Endpoints,
    pub state: &'a mut StateMachine,
    pub descriptors: &'a Descriptors<'d>,
}

impl<'a, 'd, P: Transceiver> Context<'a, 'd, P> {
    fn active_configuration(&self) -> Option<Configuration<'d>> {
        match self.state.configuration() {
            0 => None,
            value => self.descriptors.configuration_by_value(value),
        }
    }

    /// The configuration whose attributes describe the device right now
    fn reported_configuration(&self) -> Option<Configuration<'d>> {
        self.active_configuration()
            .or_else(|| self.descriptors.configuration(0))
    }

    fn require(&self, allowed: &[DeviceState]) -> Result<(), RequestError> {
        if allowed.contains(&self.state.state()) {
            Ok(())
        } else {
            Err(RequestError::InvalidState)
        }
    }

    fn io(&mut self) -> EndpointIo<'_, P> {
        let configured = self.state.state() == DeviceState::Configured;
        EndpointIo::new(self.phy, self.endpoints, configured)
    }
}

const ADDRESSED: &[DeviceState] = &[DeviceState::Addressed, DeviceState::Configured];
const CONFIGURED: &[DeviceState] = &[DeviceState::Configured];
const AFTER_RESET: &[DeviceState] = &[
    DeviceState::Default,
    DeviceState::Addressed,
    DeviceState::Configured,
];

/// Handle a standard request
///
/// IN data is written to `buffer`, unless the response borrows descriptor
/// bytes directly.
pub(crate) fn handle<'d, P: Transceiver, C: Class>(
    ctx: &mut Context<'_, 'd, P>,
    class: &mut C,
    setup: &SetupPacket,
    buffer: &mut [u8],
) -> Result<Response<'d>, RequestError> {
    use Recipient::{Device, Endpoint, Interface};
    use UsbDirection::{In, Out};

    // No standard OUT request that's handled here has a data stage. Reject
    // before any state changes.
    if setup.direction == Out && setup.has_data() {
        return Err(RequestError::Unsupported);
    }

    match (setup.direction, setup.recipient, setup.request) {
        (In, Device, Request::GET_STATUS) => {
            ctx.require(AFTER_RESET)?;
            let self_powered = ctx
                .reported_configuration()
                .map_or(false, |configuration| configuration.self_powered());
            let status =
                ctx.state.remote_wakeup_enabled() as u16 | (self_powered as u16) << 1;
            status_response(buffer, status)
        }
        (In, Interface, Request::GET_STATUS) => {
            ctx.require(CONFIGURED)?;
            interface(ctx, setup)?;
            status_response(buffer, 0)
        }
        (In, Endpoint, Request::GET_STATUS) => {
            let address = endpoint_address(setup)?;
            let halted = if address.index() == 0 {
                ctx.require(AFTER_RESET)?;
                false
            } else {
                ctx.require(CONFIGURED)?;
                ctx.endpoints
                    .get(address)
                    .ok_or(RequestError::InvalidValue)?
                    .is_halted()
            };
            status_response(buffer, halted as u16)
        }

        (Out, Device, Request::SET_FEATURE | Request::CLEAR_FEATURE)
            if setup.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
        {
            ctx.require(ADDRESSED)?;
            let enable = setup.request == Request::SET_FEATURE;
            let supported = ctx
                .reported_configuration()
                .map_or(false, |configuration| configuration.remote_wakeup());
            if enable && !supported {
                return Err(RequestError::Unsupported);
            }
            ctx.state.set_remote_wakeup(enable);
            debug!("REMOTE WAKEUP {}", enable);
            Ok(Response::Accept)
        }
        (Out, Endpoint, Request::SET_FEATURE | Request::CLEAR_FEATURE)
            if setup.value == Request::FEATURE_ENDPOINT_HALT =>
        {
            let address = endpoint_address(setup)?;
            let halt = setup.request == Request::SET_FEATURE;
            if address.index() == 0 {
                ctx.require(AFTER_RESET)?;
                // Endpoint zero halts only by protocol stall.
                return if halt {
                    Err(RequestError::Unsupported)
                } else {
                    Ok(Response::Accept)
                };
            }
            ctx.require(CONFIGURED)?;
            let result = if halt {
                ctx.endpoints.stall(ctx.phy, address)
            } else {
                ctx.endpoints.unstall(ctx.phy, address)
            };
            result.map_err(|_| RequestError::InvalidValue)?;
            debug!("EP{:#X} HALT {}", u8::from(address), halt);
            Ok(Response::Accept)
        }

        (Out, Device, Request::SET_ADDRESS) => {
            ctx.require(&[DeviceState::Default, DeviceState::Addressed])?;
            if setup.value > 127 || setup.index != 0 {
                return Err(RequestError::InvalidValue);
            }
            Ok(Response::SetAddress(setup.value as u8))
        }

        (In, Device, Request::GET_DESCRIPTOR) => {
            ctx.require(AFTER_RESET)?;
            get_descriptor(ctx.descriptors, setup, buffer)
        }
        (In, Interface, Request::GET_DESCRIPTOR) => {
            // Class descriptors, like a HID report descriptor.
            ctx.require(AFTER_RESET)?;
            let (kind, _) = setup.descriptor_type_index();
            if (descriptor_type::DEVICE..=descriptor_type::INTERFACE_POWER).contains(&kind) {
                return Err(RequestError::Unsupported);
            }
            class
                .control_in(setup, buffer)
                .map(|length| Response::Data(length.min(buffer.len())))
                .ok_or(RequestError::Unsupported)
        }

        (In, Device, Request::GET_CONFIGURATION) => {
            ctx.require(ADDRESSED)?;
            let buffer = buffer.get_mut(..1).ok_or(RequestError::Unsupported)?;
            buffer[0] = ctx.state.configuration();
            Ok(Response::Data(1))
        }
        (Out, Device, Request::SET_CONFIGURATION) => {
            ctx.require(ADDRESSED)?;
            let value = u8::try_from(setup.value).map_err(|_| RequestError::InvalidValue)?;
            set_configuration(ctx, class, value)?;
            Ok(Response::Accept)
        }

        (In, Interface, Request::GET_INTERFACE) => {
            ctx.require(CONFIGURED)?;
            let number = interface(ctx, setup)?;
            let alternate = ctx
                .state
                .alternate(number)
                .ok_or(RequestError::InvalidValue)?;
            let buffer = buffer.get_mut(..1).ok_or(RequestError::Unsupported)?;
            buffer[0] = alternate;
            Ok(Response::Data(1))
        }
        (Out, Interface, Request::SET_INTERFACE) => {
            ctx.require(CONFIGURED)?;
            let number = u8::try_from(setup.index).map_err(|_| RequestError::InvalidValue)?;
            let alternate = u8::try_from(setup.value).map_err(|_| RequestError::InvalidValue)?;
            set_interface(ctx, class, number, alternate)?;
            Ok(Response::Accept)
        }

        // SET_DESCRIPTOR, SYNCH_FRAME, TEST_MODE, interface features, and
        // anything unknown.
        _ => Err(RequestError::Unsupported),
    }
}

fn status_response<'d>(buffer: &mut [u8], status: u16) -> Result<Response<'d>, RequestError> {
    let buffer = buffer.get_mut(..2).ok_or(RequestError::Unsupported)?;
    buffer.copy_from_slice(&status.to_le_bytes());
    Ok(Response::Data(2))
}

/// The endpoint named by `wIndex`
fn endpoint_address(setup: &SetupPacket) -> Result<EndpointAddress, RequestError> {
    u8::try_from(setup.index)
        .map(EndpointAddress::from)
        .map_err(|_| RequestError::InvalidValue)
}

/// Validate the interface named by `wIndex`
fn interface<P: Transceiver>(ctx: &Context<'_, '_, P>, setup: &SetupPacket) -> Result<u8, RequestError> {
    let number = u8::try_from(setup.index).map_err(|_| RequestError::InvalidValue)?;
    match ctx.active_configuration() {
        Some(configuration) if configuration.has_interface(number) => Ok(number),
        _ => Err(RequestError::InvalidValue),
    }
}

fn get_descriptor<'d>(
    descriptors: &Descriptors<'d>,
    setup: &SetupPacket,
    buffer: &mut [u8],
) -> Result<Response<'d>, RequestError> {
    let (kind, index) = setup.descriptor_type_index();
    match kind {
        descriptor_type::DEVICE => {
            let device = descriptors.device();
            let buffer = buffer
                .get_mut(..device.len())
                .ok_or(RequestError::Unsupported)?;
            buffer.copy_from_slice(device);
            Ok(Response::Data(device.len()))
        }
        descriptor_type::CONFIGURATION => descriptors
            .configuration(index)
            .map(|configuration| Response::Static(configuration.bytes()))
            .ok_or(RequestError::InvalidValue),
        descriptor_type::STRING => descriptors
            .string(index, setup.index, buffer)
            .map(Response::Data)
            .ok_or(RequestError::InvalidValue),
        // Interface and endpoint descriptors only travel inside a
        // configuration. A full speed device has no qualifier.
        _ => Err(RequestError::Unsupported),
    }
}

/// Leave the configured state
fn deconfigure<P: Transceiver, C: Class>(ctx: &mut Context<'_, '_, P>, class: &mut C) {
    let was_configured = ctx.state.configuration() != 0;
    ctx.endpoints.remove_all(ctx.phy);
    ctx.state.set_configuration(0);
    if was_configured {
        ctx.phy.unconfigure();
        debug!("UNCONFIGURED");
        class.configured(&mut ctx.io(), None);
    }
}

/// Switch to configuration `value`, or deconfigure when it's zero
///
/// If the configuration's endpoints can't be supported, the device stays in
/// its current configuration.
fn set_configuration<P: Transceiver, C: Class>(
    ctx: &mut Context<'_, '_, P>,
    class: &mut C,
    value: u8,
) -> Result<(), RequestError> {
    if value == 0 {
        deconfigure(ctx, class);
        return Ok(());
    }
    let configuration = ctx
        .descriptors
        .configuration_by_value(value)
        .ok_or(RequestError::InvalidValue)?;

    let mut scratch = Endpoints::new();
    for endpoint in configuration.default_endpoints() {
        scratch
            .reserve(
                ctx.phy.endpoint_table(),
                endpoint.address,
                endpoint.kind,
                endpoint.max_packet,
            )
            .map_err(|error| {
                warn!("CONFIGURATION {} DOES NOT FIT: {:?}", value, error);
                RequestError::Resources(error)
            })?;
    }

    deconfigure(ctx, class);
    for endpoint in configuration.default_endpoints() {
        if let Err(error) = ctx.endpoints.add(
            ctx.phy,
            endpoint.address,
            endpoint.kind,
            endpoint.max_packet,
        ) {
            warn!("CONFIGURATION {} FAILED: {:?}", value, error);
            ctx.endpoints.remove_all(ctx.phy);
            return Err(RequestError::Resources(error));
        }
    }
    ctx.state.set_configuration(value);
    ctx.phy.configure();
    debug!("CONFIGURED {}", value);
    class.configured(&mut ctx.io(), Some(configuration));
    Ok(())
}

/// Select an alternate setting
///
/// The old setting's endpoints are removed and the new setting's endpoints
/// added in one step. If the new endpoints don't fit, the old setting stays.
fn set_interface<P: Transceiver, C: Class>(
    ctx: &mut Context<'_, '_, P>,
    class: &mut C,
    interface: u8,
    alternate: u8,
) -> Result<(), RequestError> {
    let configuration = ctx
        .active_configuration()
        .ok_or(RequestError::InvalidState)?;
    if !configuration.has_alternate(interface, alternate) {
        return Err(RequestError::InvalidValue);
    }
    let current = ctx
        .state
        .alternate(interface)
        .ok_or(RequestError::InvalidValue)?;

    let mut scratch = ctx.endpoints.clone();
    for endpoint in configuration.endpoints(interface, current) {
        scratch.release(ctx.phy.endpoint_table(), endpoint.address);
    }
    for endpoint in configuration.endpoints(interface, alternate) {
        scratch
            .reserve(
                ctx.phy.endpoint_table(),
                endpoint.address,
                endpoint.kind,
                endpoint.max_packet,
            )
            .map_err(RequestError::Resources)?;
    }

    for endpoint in configuration.endpoints(interface, current) {
        ctx.endpoints.remove(ctx.phy, endpoint.address);
    }
    for endpoint in configuration.endpoints(interface, alternate) {
        if let Err(error) = ctx.endpoints.add(
            ctx.phy,
            endpoint.address,
            endpoint.kind,
            endpoint.max_packet,
        ) {
            warn!("INTERFACE {} ALT {} FAILED: {:?}", interface, alternate, error);
            for endpoint in configuration.endpoints(interface, alternate) {
                ctx.endpoints.remove(ctx.phy, endpoint.address);
            }
            for endpoint in configuration.endpoints(interface, current) {
                let restored = ctx.endpoints.add(
                    ctx.phy,
                    endpoint.address,
                    endpoint.kind,
                    endpoint.max_packet,
                );
                if restored.is_err() {
                    warn!("LOST EP{:#X}", u8::from(endpoint.address));
                }
            }
            return Err(RequestError::Resources(error));
        }
    }

    ctx.state.set_alternate(interface, alternate);
    debug!("INTERFACE {} ALT {}", interface, alternate);
    class.interface_changed(&mut ctx.io(), interface, alternate);
    Ok(())
}
