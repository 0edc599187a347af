//! The USB device
//!
//! [`Device`] owns the transceiver, the descriptors, and all protocol state.
//! Call [`process()`](Device::process) from the USB interrupt, or from a
//! loop, to handle whatever the transceiver reported since the last call.

use crate::{
    class::{Class, EndpointIo},
    control::{Completion, ControlPipe, Response, Stage},
    descriptor::Descriptors,
    endpoint::{Endpoint, Endpoints},
    phy::{EventFlags, Events, Transceiver, ENDPOINT_NUMBERS},
    setup::SetupPacket,
    standard::{self, Context},
    state::{DeviceState, StateMachine},
    CONTROL_BUFFER_SIZE, MIN_DISCONNECT_TIME_US,
};
use heapless::spsc::{Consumer, Producer, Queue};
use usb_device::{
    control::RequestType, endpoint::EndpointAddress, UsbDirection, UsbError,
};

/// An application request, performed during the next [`Device::process`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deferred {
    /// Signal remote wakeup, if the host enabled it
    RemoteWakeup,
    /// Halt an endpoint
    Stall(EndpointAddress),
    /// Clear an endpoint halt
    Unstall(EndpointAddress),
}

/// Queue size for deferred requests; one slot is always free
pub const DEFERRED_CAPACITY: usize = 8;

/// Backing storage for deferred requests
///
/// ```
/// use usbd_engine::{DeferredQueue, Requests};
///
/// let mut queue = DeferredQueue::new();
/// let (producer, consumer) = queue.split();
/// let mut requests = Requests::new(producer);
/// // Give `consumer` to Device::with_requests
/// # let _ = consumer;
/// requests.remote_wakeup().unwrap();
/// ```
pub type DeferredQueue = Queue<Deferred, DEFERRED_CAPACITY>;
pub type DeferredProducer<'q> = Producer<'q, Deferred, DEFERRED_CAPACITY>;
pub type DeferredConsumer<'q> = Consumer<'q, Deferred, DEFERRED_CAPACITY>;

/// Sends requests to a device from outside its dispatch context
///
/// Requests are performed in order, the next time the device processes
/// events.
pub struct Requests<'q> {
    producer: DeferredProducer<'q>,
}

impl<'q> Requests<'q> {
    pub fn new(producer: DeferredProducer<'q>) -> Self {
        Requests { producer }
    }

    /// Queue a request
    ///
    /// Returns `InvalidState` if the queue is full.
    pub fn send(&mut self, request: Deferred) -> Result<(), UsbError> {
        self.producer
            .enqueue(request)
            .map_err(|_| UsbError::InvalidState)
    }

    pub fn remote_wakeup(&mut self) -> Result<(), UsbError> {
        self.send(Deferred::RemoteWakeup)
    }

    pub fn stall(&mut self, address: EndpointAddress) -> Result<(), UsbError> {
        self.send(Deferred::Stall(address))
    }

    pub fn unstall(&mut self, address: EndpointAddress) -> Result<(), UsbError> {
        self.send(Deferred::Unstall(address))
    }
}

/// A USB device
///
/// `SIZE` is the capacity of the control transfer buffer. It bounds the
/// data stage of OUT requests, and the IN data that handlers write to the
/// buffer. Descriptors served from the repository aren't copied, and aren't
/// limited by `SIZE`.
pub struct Device<'d, P, const SIZE: usize = CONTROL_BUFFER_SIZE> {
    phy: P,
    descriptors: Descriptors<'d>,
    control: ControlPipe<'d, SIZE>,
    endpoints: Endpoints,
    state: StateMachine,
    requests: Option<DeferredConsumer<'d>>,
    /// bMaxPacketSize0 from the device descriptor, before the transceiver
    /// grants its size
    ep0_request: u8,
    /// Last state reported to the class
    reported: DeviceState,
    initialized: bool,
    connected: bool,
    sof: bool,
}

impl<'d, P: Transceiver, const SIZE: usize> Device<'d, P, SIZE> {
    /// The buffer must hold a full endpoint zero packet.
    const BUFFER_HOLDS_PACKET: () = assert!(SIZE >= 64, "control buffer must be at least 64 bytes");

    /// Create a device
    ///
    /// Call [`init()`](Device::init), then [`connect()`](Device::connect),
    /// before the host can see it.
    pub fn new(phy: P, descriptors: Descriptors<'d>) -> Self {
        #[allow(clippy::let_unit_value)]
        let _: () = Self::BUFFER_HOLDS_PACKET;
        let ep0_request = descriptors.max_packet_size_0();
        Device {
            phy,
            descriptors,
            control: ControlPipe::new(),
            endpoints: Endpoints::new(),
            state: StateMachine::new(),
            requests: None,
            ep0_request,
            reported: DeviceState::Attached,
            initialized: false,
            connected: false,
            sof: false,
        }
    }

    /// Accept requests from a [`Requests`] handle
    pub fn with_requests(mut self, consumer: DeferredConsumer<'d>) -> Self {
        self.requests = Some(consumer);
        self
    }

    /// Initialize the transceiver
    ///
    /// Endpoint zero uses the packet size that the transceiver grants, and
    /// the device descriptor reports that size. Calling `init` on an
    /// initialized device does nothing.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.phy.init();
        let granted = self.phy.ep0_set_max_packet(u16::from(self.ep0_request));
        let granted = granted.clamp(8, 64);
        if granted != u16::from(self.ep0_request) {
            debug!("EP0 MPS {} GRANTED {}", self.ep0_request, granted);
        }
        self.descriptors.set_max_packet_size_0(granted as u8);
        self.control.set_max_packet(granted);
        self.initialized = true;
        self.state.power(self.phy.powered());
    }

    /// Disconnect and shut down the transceiver
    ///
    /// Every endpoint is removed. The device can be initialized again.
    pub fn deinit(&mut self) {
        if !self.initialized {
            return;
        }
        if self.connected {
            self.phy.disconnect();
            self.connected = false;
        }
        self.detach(false);
        self.phy.deinit();
        self.initialized = false;
        self.sof = false;
    }

    /// Let the host see the device
    ///
    /// Returns `InvalidState` if the device isn't initialized.
    pub fn connect(&mut self) -> Result<(), UsbError> {
        if !self.initialized {
            return Err(UsbError::InvalidState);
        }
        if !self.connected {
            self.phy.connect();
            self.connected = true;
            debug!("CONNECT");
        }
        Ok(())
    }

    /// Detach from the bus
    ///
    /// The device forgets its address and configuration, and waits for the
    /// next bus reset. Wait at least [`MIN_DISCONNECT_TIME_US`] before you
    /// connect again, or use [`reconnect()`](Device::reconnect).
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.phy.disconnect();
        self.connected = false;
        let powered = self.phy.powered();
        self.detach(powered);
        debug!("DISCONNECT");
    }

    /// Disconnect, wait, then connect
    ///
    /// `wait` receives the number of microseconds to delay, and must not
    /// return sooner.
    pub fn reconnect(&mut self, wait: impl FnOnce(u32)) -> Result<(), UsbError> {
        self.disconnect();
        wait(MIN_DISCONNECT_TIME_US);
        self.connect()
    }

    /// Remove endpoints, drop the control transfer, and leave the bus states
    fn detach(&mut self, powered: bool) {
        self.endpoints.remove_all(&mut self.phy);
        if self.state.configuration() != 0 {
            self.phy.unconfigure();
        }
        self.control.reset();
        self.state.power(powered);
    }

    /// Handle the events the transceiver collected since the last call
    ///
    /// Deferred requests run first.
    pub fn process<C: Class>(&mut self, class: &mut C) {
        if !self.initialized {
            return;
        }
        self.report_state(class);
        self.run_requests();
        let events = self.phy.process();
        if !events.is_empty() {
            self.dispatch(class, events);
        }
        self.report_state(class);
    }

    fn run_requests(&mut self) {
        while let Some(request) = self.requests.as_mut().and_then(|consumer| consumer.dequeue()) {
            let result = match request {
                Deferred::RemoteWakeup => self.remote_wakeup(),
                Deferred::Stall(address) => self.endpoints().stall(address),
                Deferred::Unstall(address) => self.endpoints().unstall(address),
            };
            if let Err(_error) = result {
                warn!("DEFERRED {:?} FAILED: {:?}", request, _error);
            }
        }
    }

    fn report_state<C: Class>(&mut self, class: &mut C) {
        let state = self.state.state();
        if state != self.reported {
            self.reported = state;
            class.state_changed(state);
        }
    }

    /// Handle one pass of events
    ///
    /// Bus events come first. Endpoint zero IN completes before endpoint
    /// zero OUT, and both before a new SETUP. Completions reported with a
    /// bus reset predate it, and are dropped.
    fn dispatch<C: Class>(&mut self, class: &mut C, events: Events) {
        let flags = events.flags;
        if flags.contains(EventFlags::POWER) {
            debug!("POWER {}", events.powered);
            self.detach(events.powered);
            class.power(events.powered);
            self.report_state(class);
        }
        if self.state.state() == DeviceState::Attached {
            return;
        }

        let reset = flags.contains(EventFlags::RESET);
        if reset {
            self.bus_reset(class);
        }
        if flags.contains(EventFlags::SUSPEND) && self.state.suspend() {
            debug!("SUSPEND");
            class.suspend();
        }
        if flags.contains(EventFlags::RESUME) && self.state.resume() {
            debug!("RESUME");
            class.resume();
        }
        if flags.contains(EventFlags::SOF) && self.sof {
            class.start_of_frame(events.frame);
        }

        if !reset {
            if flags.contains(EventFlags::EP0_IN) {
                self.ep0_in();
            }
            if flags.contains(EventFlags::EP0_OUT) {
                self.ep0_out(class);
            }
            self.endpoint_events(class, events.ep_in, UsbDirection::In);
            self.endpoint_events(class, events.ep_out, UsbDirection::Out);
        }
        if flags.contains(EventFlags::EP0_SETUP) {
            self.ep0_setup(class);
        }
    }

    /// The transceiver already removed its endpoints and cleared its address
    fn bus_reset<C: Class>(&mut self, class: &mut C) {
        self.endpoints.clear();
        if self.state.configuration() != 0 {
            self.phy.unconfigure();
        }
        self.control.reset();
        if self.state.reset() {
            debug!("RESET");
            class.reset();
            self.report_state(class);
        }
    }

    fn endpoint_events<C: Class>(&mut self, class: &mut C, mask: u16, direction: UsbDirection) {
        for number in 1..ENDPOINT_NUMBERS {
            if mask & (1 << number) == 0 {
                continue;
            }
            let address = EndpointAddress::from_parts(number, direction);
            if !self.endpoints.complete(address) {
                warn!("STALE EP{:#X} COMPLETION", u8::from(address));
                continue;
            }
            let mut io = self.endpoints();
            match direction {
                UsbDirection::In => class.endpoint_in(&mut io, address),
                UsbDirection::Out => class.endpoint_out(&mut io, address),
            }
        }
    }

    fn ep0_setup<C: Class>(&mut self, class: &mut C) {
        let setup = SetupPacket::from_bytes(self.phy.ep0_setup_read_result());
        trace!("SETUP {:?}", setup);
        self.control.begin(setup);

        let response = match setup.request_type {
            RequestType::Standard => {
                let mut ctx = Context {
                    phy: &mut self.phy,
                    endpoints: &mut self.endpoints,
                    state: &mut self.state,
                    descriptors: &self.descriptors,
                };
                match standard::handle(&mut ctx, class, &setup, self.control.buffer_mut()) {
                    Ok(response) => response,
                    Err(_error) => {
                        debug!("REJECT {:?}: {:?}", setup, _error);
                        Response::Reject
                    }
                }
            }
            RequestType::Class | RequestType::Vendor => match setup.direction {
                UsbDirection::In => class
                    .control_in(&setup, self.control.buffer_mut())
                    .map_or(Response::Reject, Response::Data),
                // The class sees OUT data once the data stage completes.
                UsbDirection::Out if setup.has_data() => Response::Receive,
                UsbDirection::Out => {
                    if class.control_out(&setup, &[]) {
                        Response::Accept
                    } else {
                        Response::Reject
                    }
                }
            },
            RequestType::Reserved => Response::Reject,
        };
        self.control.respond(&mut self.phy, response);
    }

    fn ep0_in(&mut self) {
        if let Some(Completion::Address(address)) = self.control.in_complete(&mut self.phy) {
            self.phy.set_address(address);
            self.state.set_address(address);
            debug!("ADDRESS {}", address);
        }
    }

    fn ep0_out<C: Class>(&mut self, class: &mut C) {
        if let Some(Completion::DataReceived) = self.control.out_complete(&mut self.phy) {
            let accepted = match self.control.setup() {
                Some(setup) => class.control_out(setup, self.control.received()),
                None => false,
            };
            self.control.finish_out(&mut self.phy, accepted);
        }
    }

    /// Signal remote wakeup
    ///
    /// Returns `InvalidState` unless the device is suspended, and the host
    /// enabled remote wakeup.
    pub fn remote_wakeup(&mut self) -> Result<(), UsbError> {
        if !self.state.is_suspended() || !self.state.remote_wakeup_enabled() {
            return Err(UsbError::InvalidState);
        }
        self.phy.remote_wakeup();
        debug!("REMOTE WAKEUP");
        Ok(())
    }

    /// Forward start-of-frame events to the class
    ///
    /// Returns `InvalidState` if the device isn't initialized.
    pub fn set_sof_enabled(&mut self, enabled: bool) -> Result<(), UsbError> {
        if !self.initialized {
            return Err(UsbError::InvalidState);
        }
        if enabled != self.sof {
            if enabled {
                self.phy.sof_enable();
            } else {
                self.phy.sof_disable();
            }
            self.sof = enabled;
        }
        Ok(())
    }

    /// Transfers on the non-zero endpoints, outside of class callbacks
    pub fn endpoints(&mut self) -> EndpointIo<'_, P> {
        let configured = self.state.state() == DeviceState::Configured;
        EndpointIo::new(&mut self.phy, &mut self.endpoints, configured)
    }

    pub fn endpoint(&self, address: EndpointAddress) -> Option<&Endpoint> {
        self.endpoints.get(address)
    }

    pub fn state(&self) -> DeviceState {
        self.state.state()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn address(&self) -> u8 {
        self.state.address()
    }

    /// The active configuration value, or zero
    pub fn configuration(&self) -> u8 {
        self.state.configuration()
    }

    pub fn alternate(&self, interface: u8) -> Option<u8> {
        self.state.alternate(interface)
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.state.remote_wakeup_enabled()
    }

    /// Bus resets since the device was created
    pub fn resets(&self) -> u32 {
        self.state.resets()
    }

    pub fn suspends(&self) -> u32 {
        self.state.suspends()
    }

    pub fn resumes(&self) -> u32 {
        self.state.resumes()
    }

    /// Stage of the control transfer in progress
    pub fn control_stage(&self) -> Stage {
        self.control.stage()
    }

    pub fn descriptors(&self) -> &Descriptors<'d> {
        &self.descriptors
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }
}
