//! Device state machine
//!
//! `Attached -> Powered -> Default -> Addressed -> Configured`, with a
//! suspended flag on the side. The machine only records state; the device
//! performs the endpoint and transceiver work that goes with each change.

use crate::MAX_INTERFACES;

/// The USB device lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    /// No USB power
    Attached,
    /// Powered, waiting for a bus reset
    Powered,
    /// Reset, responding at address zero
    Default,
    /// Assigned a unique address
    Addressed,
    /// A configuration is active
    Configured,
}

/// Device state, address, configuration and alternate settings
#[derive(Clone, Debug)]
pub struct StateMachine {
    state: DeviceState,
    suspended: bool,
    address: u8,
    configuration: u8,
    alternates: [u8; MAX_INTERFACES],
    remote_wakeup: bool,
    resets: u32,
    suspends: u32,
    resumes: u32,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub const fn new() -> Self {
        StateMachine {
            state: DeviceState::Attached,
            suspended: false,
            address: 0,
            configuration: 0,
            alternates: [0; MAX_INTERFACES],
            remote_wakeup: false,
            resets: 0,
            suspends: 0,
            resumes: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The bus address, zero until SET_ADDRESS completes
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The active configuration value, zero when unconfigured
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// The active alternate setting of `interface`
    pub fn alternate(&self, interface: u8) -> Option<u8> {
        self.alternates.get(interface as usize).copied()
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    /// Bus resets observed since construction
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn suspends(&self) -> u32 {
        self.suspends
    }

    pub fn resumes(&self) -> u32 {
        self.resumes
    }

    /// Forget everything a bus reset or power loss invalidates
    fn clear(&mut self) {
        self.suspended = false;
        self.address = 0;
        self.configuration = 0;
        self.alternates = [0; MAX_INTERFACES];
        self.remote_wakeup = false;
    }

    /// USB power changed, or the device detached from the bus
    ///
    /// Counters survive, so an application can watch reconnect cycles.
    pub fn power(&mut self, powered: bool) {
        self.clear();
        self.state = if powered {
            DeviceState::Powered
        } else {
            DeviceState::Attached
        };
    }

    /// Bus reset; ignored while unpowered
    pub fn reset(&mut self) -> bool {
        if self.state == DeviceState::Attached {
            return false;
        }
        self.clear();
        self.state = DeviceState::Default;
        self.resets = self.resets.wrapping_add(1);
        true
    }

    /// Bus suspend
    ///
    /// Only a device that has seen a reset can be suspended. Returns `true`
    /// if the flag changed.
    pub fn suspend(&mut self) -> bool {
        if self.state < DeviceState::Default || self.suspended {
            return false;
        }
        self.suspended = true;
        self.suspends = self.suspends.wrapping_add(1);
        true
    }

    /// Bus resume; returns `true` if the device was suspended
    pub fn resume(&mut self) -> bool {
        if !self.suspended {
            return false;
        }
        self.suspended = false;
        self.resumes = self.resumes.wrapping_add(1);
        true
    }

    /// Apply an address after the SET_ADDRESS status stage
    ///
    /// Address zero returns an addressed device to the default state.
    pub fn set_address(&mut self, address: u8) {
        self.address = address;
        self.state = match (self.state, address) {
            (DeviceState::Default | DeviceState::Addressed, 0) => DeviceState::Default,
            (DeviceState::Default | DeviceState::Addressed, _) => DeviceState::Addressed,
            (state, _) => state,
        };
    }

    /// Select a configuration; zero returns to the addressed state
    pub fn set_configuration(&mut self, value: u8) {
        self.configuration = value;
        self.alternates = [0; MAX_INTERFACES];
        self.state = if value == 0 {
            DeviceState::Addressed
        } else {
            DeviceState::Configured
        };
    }

    /// Record an interface's alternate setting
    pub fn set_alternate(&mut self, interface: u8, alternate: u8) -> bool {
        match self.alternates.get_mut(interface as usize) {
            Some(slot) => {
                *slot = alternate;
                true
            }
            None => false,
        }
    }

    pub fn set_remote_wakeup(&mut self, enabled: bool) {
        self.remote_wakeup = enabled;
    }
}
