//! Test support: a simulated transceiver and host, descriptors, and a class

use crate::{
    class::{Class, EndpointIo},
    descriptor::{descriptor_type, Configuration, Descriptors, DeviceDescriptor, StringSet},
    device::Device,
    phy::{
        EndpointAttributes, EndpointCapability, EndpointTable, EventFlags, Events, Transceiver,
        ENDPOINT_NUMBERS,
    },
    setup::{Request, SetupPacket},
    state::DeviceState,
};
use usb_device::{
    control::{Recipient, RequestType},
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Bus address assigned by [`enumerate`]
pub const ADDRESS: u8 = 5;

/// Vendor request that stores its data stage in [`EchoClass`]
pub const ECHO_OUT: u8 = 0x01;
/// Vendor request that returns what [`ECHO_OUT`] stored
pub const ECHO_IN: u8 = 0x02;

/// A class descriptor type, served from interface zero
pub const REPORT_DESCRIPTOR: u8 = 0x22;
pub const REPORT: &[u8] = &[0x06, 0x00, 0xFF, 0x09, 0x01, 0xA1, 0x01, 0xC0];

/// Bus powered, remote wakeup, 100mA
///
/// Interface 0 has bulk endpoints 1 in alternate 0, and interrupt endpoints
/// 2 in alternate 1. Interface 1 has no endpoints in alternate 0, and an
/// isochronous IN endpoint 3 in alternate 1.
#[rustfmt::skip]
pub static CONFIG_1: [u8; 80] = [
    9, 2, 80, 0, 2, 1, 0, 0xA0, 50,
    9, 4, 0, 0, 2, 0xFF, 0, 0, 0,
    7, 5, 0x81, 2, 64, 0, 0,
    7, 5, 0x01, 2, 64, 0, 0,
    9, 4, 0, 1, 2, 0xFF, 0, 0, 0,
    7, 5, 0x82, 3, 16, 0, 1,
    7, 5, 0x02, 3, 16, 0, 1,
    9, 4, 1, 0, 0, 0xFF, 0, 0, 0,
    9, 4, 1, 1, 1, 0xFF, 0, 0, 0,
    7, 5, 0x83, 1, 0, 1, 1,
];

/// Self powered, bulk endpoints 4
#[rustfmt::skip]
pub static CONFIG_2: [u8; 32] = [
    9, 2, 32, 0, 1, 2, 0, 0xC0, 50,
    9, 4, 0, 0, 2, 0xFF, 0, 0, 0,
    7, 5, 0x84, 2, 64, 0, 0,
    7, 5, 0x04, 2, 64, 0, 0,
];

static CONFIGURATIONS: [&[u8]; 2] = [&CONFIG_1, &CONFIG_2];

static STRINGS: [StringSet<'static>; 2] = [
    StringSet::new(0x0409, &["ACM", "Engine Test", "0001"]),
    StringSet::new(0x0407, &["ACM", "Geraet", "0001"]),
];

const DEVICE: DeviceDescriptor = DeviceDescriptor::new(0x0d28, 0x0205)
    .release(0x0001)
    .manufacturer(1)
    .product(2)
    .serial_number(3);

pub fn descriptors() -> Descriptors<'static> {
    Descriptors::new(DEVICE, &CONFIGURATIONS, &STRINGS).unwrap()
}

/// Endpoint zero is control only. Every other number supports everything.
fn endpoint_table() -> EndpointTable {
    let mut endpoints = [EndpointCapability::new(
        EndpointAttributes::all().difference(EndpointAttributes::CONTROL),
        4,
        1,
    ); ENDPOINT_NUMBERS];
    endpoints[0] = EndpointCapability::new(
        EndpointAttributes::CONTROL
            | EndpointAttributes::IN
            | EndpointAttributes::OUT
            | EndpointAttributes::SIMULTANEOUS,
        0,
        0,
    );
    EndpointTable {
        resources: 4096,
        endpoints,
    }
}

#[derive(Debug)]
pub struct MockEndpoint {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet: u16,
    pub stalled: bool,
    pub aborts: usize,
    /// Size of the read in progress
    pub reading: Option<usize>,
    /// Packet waiting for the host
    pub written: Option<Vec<u8>>,
    /// Last packet from the host
    pub received: Vec<u8>,
}

/// A transceiver, and the host on the other end of the cable
///
/// `host_*` methods act as the host, and raise the events that the
/// hardware would report.
#[derive(Debug)]
pub struct MockPhy {
    pub initialized: bool,
    pub inits: usize,
    pub powered: bool,
    pub connected: bool,
    pub configured: bool,
    pub sof: bool,
    pub address: u8,
    pub remote_wakeups: usize,
    pub table: EndpointTable,

    pub ep0_max_packet: u16,
    /// Grant this size, instead of the requested size
    pub ep0_grant: Option<u16>,
    pub ep0_setup: [u8; 8],
    pub ep0_written: Option<Vec<u8>>,
    pub ep0_reading: bool,
    pub ep0_received: Vec<u8>,
    pub ep0_stalled: bool,

    pub endpoints: Vec<MockEndpoint>,
    /// Refuse every endpoint_add
    pub refuse_adds: bool,
    /// Accept this many more endpoint_adds, then refuse
    pub refuse_after: Option<usize>,

    pub events: Events,
}

impl MockPhy {
    pub fn new() -> Self {
        MockPhy {
            initialized: false,
            inits: 0,
            powered: true,
            connected: false,
            configured: false,
            sof: false,
            address: 0,
            remote_wakeups: 0,
            table: endpoint_table(),
            ep0_max_packet: 64,
            ep0_grant: None,
            ep0_setup: [0; 8],
            ep0_written: None,
            ep0_reading: false,
            ep0_received: Vec::new(),
            ep0_stalled: false,
            endpoints: Vec::new(),
            refuse_adds: false,
            refuse_after: None,
            events: Events::none(),
        }
    }

    pub fn endpoint(&self, address: EndpointAddress) -> Option<&MockEndpoint> {
        self.endpoints.iter().find(|ep| ep.address == address)
    }

    fn endpoint_mut(&mut self, address: EndpointAddress) -> Option<&mut MockEndpoint> {
        self.endpoints.iter_mut().find(|ep| ep.address == address)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn raise(&mut self, flags: EventFlags) {
        self.events.flags |= flags;
    }

    fn clear_ep0(&mut self) {
        self.ep0_written = None;
        self.ep0_reading = false;
        self.ep0_stalled = false;
    }

    pub fn host_power(&mut self, powered: bool) {
        self.powered = powered;
        self.events.powered = powered;
        self.raise(EventFlags::POWER);
    }

    /// Reset the bus, dropping every endpoint and transfer
    pub fn host_reset(&mut self) {
        self.endpoints.clear();
        self.clear_ep0();
        self.address = 0;
        self.raise(EventFlags::RESET);
    }

    pub fn host_setup(&mut self, setup: [u8; 8]) {
        self.clear_ep0();
        self.ep0_setup = setup;
        self.raise(EventFlags::EP0_SETUP);
    }

    /// Take the endpoint zero IN packet, or `None` if there's nothing to
    /// take or endpoint zero is stalled
    pub fn host_ep0_in(&mut self) -> Option<Vec<u8>> {
        if self.ep0_stalled {
            return None;
        }
        let packet = self.ep0_written.take()?;
        self.raise(EventFlags::EP0_IN);
        Some(packet)
    }

    /// Send an endpoint zero OUT packet; `false` if the device isn't reading
    pub fn host_ep0_out(&mut self, data: &[u8]) -> bool {
        if self.ep0_stalled || !self.ep0_reading {
            return false;
        }
        self.ep0_reading = false;
        self.ep0_received = data.to_vec();
        self.raise(EventFlags::EP0_OUT);
        true
    }

    pub fn host_in(&mut self, address: EndpointAddress) -> Option<Vec<u8>> {
        let endpoint = self
            .endpoints
            .iter_mut()
            .find(|ep| ep.address == address && !ep.stalled)?;
        let packet = endpoint.written.take()?;
        self.events.ep_in |= 1 << address.index();
        Some(packet)
    }

    pub fn host_out(&mut self, address: EndpointAddress, data: &[u8]) -> bool {
        let Some(endpoint) = self
            .endpoints
            .iter_mut()
            .find(|ep| ep.address == address && !ep.stalled)
        else {
            return false;
        };
        if endpoint.reading.take().is_none() {
            return false;
        }
        endpoint.received = data.to_vec();
        self.events.ep_out |= 1 << address.index();
        true
    }
}

impl Transceiver for MockPhy {
    fn init(&mut self) {
        self.initialized = true;
        self.inits += 1;
    }

    fn deinit(&mut self) {
        self.initialized = false;
        self.events = Events::none();
    }

    fn powered(&self) -> bool {
        self.powered
    }

    fn connect(&mut self) {
        self.connected = true;
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.clear_ep0();
    }

    fn configure(&mut self) {
        self.configured = true;
    }

    fn unconfigure(&mut self) {
        self.configured = false;
    }

    fn sof_enable(&mut self) {
        self.sof = true;
    }

    fn sof_disable(&mut self) {
        self.sof = false;
    }

    fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    fn remote_wakeup(&mut self) {
        self.remote_wakeups += 1;
    }

    fn endpoint_table(&self) -> &EndpointTable {
        &self.table
    }

    fn ep0_set_max_packet(&mut self, max_packet: u16) -> u16 {
        self.ep0_max_packet = self.ep0_grant.unwrap_or(max_packet);
        self.ep0_max_packet
    }

    fn ep0_setup_read_result(&mut self) -> [u8; 8] {
        self.ep0_setup
    }

    fn ep0_read(&mut self) {
        self.ep0_reading = true;
    }

    fn ep0_read_result(&mut self, buffer: &mut [u8]) -> usize {
        let len = buffer.len().min(self.ep0_received.len());
        buffer[..len].copy_from_slice(&self.ep0_received[..len]);
        len
    }

    fn ep0_write(&mut self, buffer: &[u8]) {
        assert!(buffer.len() <= usize::from(self.ep0_max_packet));
        self.ep0_written = Some(buffer.to_vec());
    }

    fn ep0_stall(&mut self) {
        self.ep0_stalled = true;
        self.ep0_written = None;
        self.ep0_reading = false;
    }

    fn endpoint_add(&mut self, address: EndpointAddress, max_packet: u16, kind: EndpointType) -> bool {
        if self.refuse_adds {
            return false;
        }
        if let Some(remaining) = &mut self.refuse_after {
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;
        }
        assert!(self.endpoint(address).is_none(), "{:?} added twice", address);
        self.endpoints.push(MockEndpoint {
            address,
            kind,
            max_packet,
            stalled: false,
            aborts: 0,
            reading: None,
            written: None,
            received: Vec::new(),
        });
        true
    }

    fn endpoint_remove(&mut self, address: EndpointAddress) {
        self.endpoints.retain(|ep| ep.address != address);
    }

    fn endpoint_stall(&mut self, address: EndpointAddress) {
        if let Some(endpoint) = self.endpoint_mut(address) {
            endpoint.stalled = true;
        }
    }

    fn endpoint_unstall(&mut self, address: EndpointAddress) {
        if let Some(endpoint) = self.endpoint_mut(address) {
            endpoint.stalled = false;
        }
    }

    fn endpoint_read(&mut self, address: EndpointAddress, size: usize) -> bool {
        match self.endpoint_mut(address) {
            Some(endpoint) => {
                endpoint.reading = Some(size);
                true
            }
            None => false,
        }
    }

    fn endpoint_read_result(&mut self, address: EndpointAddress, buffer: &mut [u8]) -> usize {
        let Some(endpoint) = self.endpoint(address) else {
            return 0;
        };
        let len = buffer.len().min(endpoint.received.len());
        buffer[..len].copy_from_slice(&endpoint.received[..len]);
        len
    }

    fn endpoint_write(&mut self, address: EndpointAddress, buffer: &[u8]) -> bool {
        match self.endpoint_mut(address) {
            Some(endpoint) => {
                assert!(buffer.len() <= usize::from(endpoint.max_packet));
                endpoint.written = Some(buffer.to_vec());
                true
            }
            None => false,
        }
    }

    fn endpoint_abort(&mut self, address: EndpointAddress) {
        if let Some(endpoint) = self.endpoint_mut(address) {
            endpoint.aborts += 1;
            endpoint.reading = None;
            endpoint.written = None;
        }
    }

    fn process(&mut self) -> Events {
        if !self.initialized {
            return Events::none();
        }
        core::mem::replace(&mut self.events, Events::none())
    }
}

pub type TestDevice = Device<'static, MockPhy>;

/// The host saw a STALL handshake
#[derive(Debug, PartialEq, Eq)]
pub struct Stalled;

/// An initialized and connected device
pub fn device() -> TestDevice {
    let mut device = Device::new(MockPhy::new(), descriptors());
    device.init();
    device.connect().unwrap();
    device
}

pub fn standard(
    direction: UsbDirection,
    recipient: Recipient,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> SetupPacket {
    SetupPacket {
        direction,
        request_type: RequestType::Standard,
        recipient,
        request,
        value,
        index,
        length,
    }
}

pub fn vendor(direction: UsbDirection, request: u8, length: u16) -> SetupPacket {
    SetupPacket {
        direction,
        request_type: RequestType::Vendor,
        recipient: Recipient::Device,
        request,
        value: 0,
        index: 0,
        length,
    }
}

pub fn get_descriptor(kind: u8, index: u8, length: u16) -> SetupPacket {
    standard(
        UsbDirection::In,
        Recipient::Device,
        Request::GET_DESCRIPTOR,
        u16::from(kind) << 8 | u16::from(index),
        0,
        length,
    )
}

/// Run an IN control transfer, through its status stage
pub fn control_in<C: Class>(
    device: &mut Device<'_, MockPhy>,
    class: &mut C,
    setup: SetupPacket,
) -> Result<Vec<u8>, Stalled> {
    device.phy_mut().host_setup(setup.to_bytes());
    device.process(class);

    let max_packet = usize::from(device.phy().ep0_max_packet);
    let mut data = Vec::new();
    loop {
        let packet = device.phy_mut().host_ep0_in().ok_or(Stalled)?;
        device.process(class);
        data.extend_from_slice(&packet);
        if packet.len() < max_packet || data.len() >= usize::from(setup.length) {
            break;
        }
    }

    if !device.phy_mut().host_ep0_out(&[]) {
        return Err(Stalled);
    }
    device.process(class);
    Ok(data)
}

/// Run an OUT control transfer, through its status stage
pub fn control_out<C: Class>(
    device: &mut Device<'_, MockPhy>,
    class: &mut C,
    setup: SetupPacket,
    data: &[u8],
) -> Result<(), Stalled> {
    device.phy_mut().host_setup(setup.to_bytes());
    device.process(class);

    let max_packet = usize::from(device.phy().ep0_max_packet);
    for packet in data.chunks(max_packet) {
        if !device.phy_mut().host_ep0_out(packet) {
            return Err(Stalled);
        }
        device.process(class);
    }

    match device.phy_mut().host_ep0_in() {
        Some(status) if status.is_empty() => {
            device.process(class);
            Ok(())
        }
        _ => Err(Stalled),
    }
}

/// Reset the bus, and enumerate the device into configuration 1
pub fn enumerate<C: Class>(device: &mut Device<'_, MockPhy>, class: &mut C) -> Result<(), Stalled> {
    device.phy_mut().host_reset();
    device.process(class);

    control_in(device, class, get_descriptor(descriptor_type::DEVICE, 0, 64))?;
    let set_address = standard(
        UsbDirection::Out,
        Recipient::Device,
        Request::SET_ADDRESS,
        u16::from(ADDRESS),
        0,
        0,
    );
    control_out(device, class, set_address, &[])?;
    control_in(device, class, get_descriptor(descriptor_type::CONFIGURATION, 0, 9))?;
    control_in(device, class, get_descriptor(descriptor_type::CONFIGURATION, 0, 255))?;
    let set_configuration = standard(
        UsbDirection::Out,
        Recipient::Device,
        Request::SET_CONFIGURATION,
        1,
        0,
        0,
    );
    control_out(device, class, set_configuration, &[])
}

/// Echoes bulk OUT packets back on the IN endpoint with the same number
///
/// Also answers the [`ECHO_OUT`] and [`ECHO_IN`] vendor requests, and
/// records every callback.
#[derive(Debug, Default)]
pub struct EchoClass {
    pub configured: Option<u8>,
    pub states: Vec<DeviceState>,
    pub alternates: Vec<(u8, u8)>,
    /// Stored by ECHO_OUT
    pub data: Vec<u8>,
    /// Everything received on OUT endpoints
    pub received: Vec<u8>,
    pub sent: usize,
    pub resets: usize,
    pub frames: usize,
    pub suspends: usize,
    pub resumes: usize,
}

impl Class for EchoClass {
    fn reset(&mut self) {
        self.resets += 1;
    }

    fn suspend(&mut self) {
        self.suspends += 1;
    }

    fn resume(&mut self) {
        self.resumes += 1;
    }

    fn start_of_frame(&mut self, _: u16) {
        self.frames += 1;
    }

    fn state_changed(&mut self, state: DeviceState) {
        self.states.push(state);
    }

    fn control_in(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> Option<usize> {
        match (setup.request_type, setup.recipient, setup.request) {
            (RequestType::Vendor, _, ECHO_IN) => {
                let len = self.data.len().min(buffer.len());
                buffer[..len].copy_from_slice(&self.data[..len]);
                Some(len)
            }
            (RequestType::Standard, Recipient::Interface, Request::GET_DESCRIPTOR)
                if setup.descriptor_type_index().0 == REPORT_DESCRIPTOR && setup.index == 0 =>
            {
                buffer[..REPORT.len()].copy_from_slice(REPORT);
                Some(REPORT.len())
            }
            _ => None,
        }
    }

    fn control_out(&mut self, setup: &SetupPacket, data: &[u8]) -> bool {
        match (setup.request_type, setup.request) {
            (RequestType::Vendor, ECHO_OUT) => {
                self.data = data.to_vec();
                true
            }
            _ => false,
        }
    }

    fn configured<P: Transceiver>(
        &mut self,
        io: &mut EndpointIo<'_, P>,
        configuration: Option<Configuration<'_>>,
    ) {
        self.configured = configuration.map(|configuration| configuration.value());
        let Some(configuration) = configuration else {
            return;
        };
        for endpoint in configuration.default_endpoints() {
            if endpoint.address.direction() == UsbDirection::Out {
                io.read(endpoint.address).unwrap();
            }
        }
    }

    fn interface_changed<P: Transceiver>(
        &mut self,
        _: &mut EndpointIo<'_, P>,
        interface: u8,
        alternate: u8,
    ) {
        self.alternates.push((interface, alternate));
    }

    fn endpoint_in<P: Transceiver>(&mut self, _: &mut EndpointIo<'_, P>, _: EndpointAddress) {
        self.sent += 1;
    }

    fn endpoint_out<P: Transceiver>(&mut self, io: &mut EndpointIo<'_, P>, address: EndpointAddress) {
        let mut buffer = [0; 1024];
        let len = io.read_result(address, &mut buffer).unwrap();
        self.received.extend_from_slice(&buffer[..len]);
        let echo = EndpointAddress::from_parts(address.index(), UsbDirection::In);
        io.write(echo, &buffer[..len]).unwrap();
        io.read(address).unwrap();
    }
}
