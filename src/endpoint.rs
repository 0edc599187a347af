//! Endpoint manager
//!
//! Tracks the non-zero endpoints that the current configuration and
//! alternate settings declare. Endpoint zero is owned by the control pipe,
//! and never appears here.

use crate::phy::{EndpointAttributes, EndpointTable, Transceiver, ENDPOINT_NUMBERS};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// One slot per endpoint number, per direction
pub const MAX_ENDPOINTS: usize = ENDPOINT_NUMBERS * 2;

/// Largest max packet size of any full or high speed endpoint
const MAX_PACKET_LIMIT: u16 = 1024;

/// Produces an index into the endpoint slots
fn index(addr: EndpointAddress) -> usize {
    (addr.index() * 2) + (UsbDirection::In == addr.direction()) as usize
}

/// The same endpoint number, opposite direction
fn opposite(addr: EndpointAddress) -> EndpointAddress {
    let direction = match addr.direction() {
        UsbDirection::In => UsbDirection::Out,
        UsbDirection::Out => UsbDirection::In,
    };
    EndpointAddress::from_parts(addr.index(), direction)
}

/// A non-zero endpoint
///
/// Type and max packet size are fixed while the endpoint exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    address: EndpointAddress,
    kind: EndpointType,
    max_packet: u16,
    halted: bool,
    busy: bool,
}

impl Endpoint {
    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn kind(&self) -> EndpointType {
        self.kind
    }

    pub fn max_packet(&self) -> u16 {
        self.max_packet
    }

    /// Returns `true` if the halt feature is set
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Returns `true` if a read or write is in flight
    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

/// The table of added endpoints
///
/// `Endpoints` charges each endpoint against the transceiver's resource
/// budget. Cloning the table gives a scratch copy, which is how
/// configuration changes are checked before anything is committed.
#[derive(Clone, Debug)]
pub struct Endpoints {
    slots: [Option<Endpoint>; MAX_ENDPOINTS],
    /// Bit `n` is set when slot `n` is occupied
    mask: u32,
    /// Resources charged against the table's budget
    used: u32,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoints {
    pub const fn new() -> Self {
        Endpoints {
            slots: [None; MAX_ENDPOINTS],
            mask: 0,
            used: 0,
        }
    }

    /// Acquire the endpoint
    ///
    /// Returns `None` if the endpoint isn't added.
    pub fn get(&self, addr: EndpointAddress) -> Option<&Endpoint> {
        if addr.index() >= ENDPOINT_NUMBERS {
            return None;
        }
        self.slots[index(addr)].as_ref()
    }

    fn get_mut(&mut self, addr: EndpointAddress) -> Option<&mut Endpoint> {
        if addr.index() >= ENDPOINT_NUMBERS {
            return None;
        }
        self.slots[index(addr)].as_mut()
    }

    /// Number of added endpoints
    pub fn len(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Resources consumed by the added endpoints
    pub fn resources_used(&self) -> u32 {
        self.used
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.slots.iter().flatten()
    }

    /// Book an endpoint without touching the hardware
    ///
    /// Fails if
    ///
    /// - the address is endpoint zero, out of range, or already booked
    ///   (`InvalidEndpoint`),
    /// - the endpoint number doesn't support this type or direction, or the
    ///   max packet size is invalid (`EndpointOverflow`),
    /// - the resource budget is exhausted (`EndpointMemoryOverflow`).
    pub(crate) fn reserve(
        &mut self,
        table: &EndpointTable,
        addr: EndpointAddress,
        kind: EndpointType,
        max_packet: u16,
    ) -> Result<(), UsbError> {
        if addr.index() == 0 || addr.index() >= ENDPOINT_NUMBERS {
            return Err(UsbError::InvalidEndpoint);
        }
        let idx = index(addr);
        if self.mask & (1 << idx) != 0 {
            return Err(UsbError::InvalidEndpoint);
        }

        let capability = table.capability(addr);
        if !capability.allows(kind, addr.direction())
            || max_packet == 0
            || max_packet > MAX_PACKET_LIMIT
        {
            return Err(UsbError::EndpointOverflow);
        }
        let opposite_in_use = self.mask & (1 << index(opposite(addr))) != 0;
        if opposite_in_use
            && !capability
                .attributes
                .contains(EndpointAttributes::SIMULTANEOUS)
        {
            return Err(UsbError::EndpointOverflow);
        }

        let used = self.used + capability.cost(max_packet);
        if used > table.resources {
            return Err(UsbError::EndpointMemoryOverflow);
        }

        self.slots[idx] = Some(Endpoint {
            address: addr,
            kind,
            max_packet,
            halted: false,
            busy: false,
        });
        self.mask |= 1 << idx;
        self.used = used;
        Ok(())
    }

    /// Drop a booking, returning the endpoint if it existed
    pub(crate) fn release(
        &mut self,
        table: &EndpointTable,
        addr: EndpointAddress,
    ) -> Option<Endpoint> {
        if addr.index() >= ENDPOINT_NUMBERS {
            return None;
        }
        let idx = index(addr);
        let endpoint = self.slots[idx].take()?;
        self.mask &= !(1 << idx);
        self.used -= table.capability(addr).cost(endpoint.max_packet);
        Some(endpoint)
    }

    /// Add an endpoint, and enable it in the transceiver
    ///
    /// Nothing changes if the transceiver refuses the endpoint.
    pub(crate) fn add<P: Transceiver>(
        &mut self,
        phy: &mut P,
        addr: EndpointAddress,
        kind: EndpointType,
        max_packet: u16,
    ) -> Result<(), UsbError> {
        self.reserve(phy.endpoint_table(), addr, kind, max_packet)?;
        if !phy.endpoint_add(addr, max_packet, kind) {
            warn!("TRANSCEIVER REFUSED EP{:#X}", u8::from(addr));
            self.release(phy.endpoint_table(), addr);
            return Err(UsbError::EndpointOverflow);
        }
        debug!("ADDED EP{:#X} MPS={}", u8::from(addr), max_packet);
        Ok(())
    }

    /// Remove an endpoint from the table and the transceiver
    ///
    /// Removing an absent endpoint does nothing.
    pub(crate) fn remove<P: Transceiver>(&mut self, phy: &mut P, addr: EndpointAddress) {
        if let Some(endpoint) = self.release(phy.endpoint_table(), addr) {
            if endpoint.busy {
                phy.endpoint_abort(addr);
            }
            phy.endpoint_remove(addr);
            debug!("REMOVED EP{:#X}", u8::from(addr));
        }
    }

    /// Remove every endpoint
    pub(crate) fn remove_all<P: Transceiver>(&mut self, phy: &mut P) {
        for idx in 0..MAX_ENDPOINTS {
            if let Some(endpoint) = self.slots[idx] {
                self.remove(phy, endpoint.address);
            }
        }
    }

    /// Forget every endpoint without telling the transceiver
    ///
    /// Used after a bus reset, when the transceiver has already dropped them.
    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }

    /// Set the halt feature
    pub(crate) fn stall<P: Transceiver>(
        &mut self,
        phy: &mut P,
        addr: EndpointAddress,
    ) -> Result<(), UsbError> {
        let endpoint = self.get_mut(addr).ok_or(UsbError::InvalidEndpoint)?;
        endpoint.halted = true;
        phy.endpoint_stall(addr);
        Ok(())
    }

    /// Clear the halt feature
    ///
    /// Any transfer in flight is aborted, and the transceiver resets the
    /// data toggle. This happens even if the endpoint wasn't halted.
    pub(crate) fn unstall<P: Transceiver>(
        &mut self,
        phy: &mut P,
        addr: EndpointAddress,
    ) -> Result<(), UsbError> {
        let endpoint = self.get_mut(addr).ok_or(UsbError::InvalidEndpoint)?;
        let busy = endpoint.busy;
        endpoint.halted = false;
        endpoint.busy = false;
        if busy {
            phy.endpoint_abort(addr);
        }
        phy.endpoint_unstall(addr);
        Ok(())
    }

    /// Check that an endpoint can start a transfer in `direction`
    fn idle_mut(
        &mut self,
        addr: EndpointAddress,
        direction: UsbDirection,
    ) -> Result<&mut Endpoint, UsbError> {
        if addr.direction() != direction {
            return Err(UsbError::InvalidEndpoint);
        }
        let endpoint = self.get_mut(addr).ok_or(UsbError::InvalidEndpoint)?;
        if endpoint.halted {
            return Err(UsbError::InvalidState);
        }
        if endpoint.busy {
            return Err(UsbError::WouldBlock);
        }
        Ok(endpoint)
    }

    /// Start sending `buffer` on an IN endpoint
    pub(crate) fn start_write<P: Transceiver>(
        &mut self,
        phy: &mut P,
        addr: EndpointAddress,
        buffer: &[u8],
    ) -> Result<usize, UsbError> {
        let endpoint = self.idle_mut(addr, UsbDirection::In)?;
        if buffer.len() > endpoint.max_packet as usize {
            return Err(UsbError::BufferOverflow);
        }
        if !phy.endpoint_write(addr, buffer) {
            return Err(UsbError::WouldBlock);
        }
        endpoint.busy = true;
        trace!("EP{:#X} WRITE {}", u8::from(addr), buffer.len());
        Ok(buffer.len())
    }

    /// Start receiving one packet on an OUT endpoint
    pub(crate) fn start_read<P: Transceiver>(
        &mut self,
        phy: &mut P,
        addr: EndpointAddress,
    ) -> Result<(), UsbError> {
        let endpoint = self.idle_mut(addr, UsbDirection::Out)?;
        if !phy.endpoint_read(addr, endpoint.max_packet as usize) {
            return Err(UsbError::WouldBlock);
        }
        endpoint.busy = true;
        trace!("EP{:#X} READ", u8::from(addr));
        Ok(())
    }

    /// Copy the data of a completed read
    pub(crate) fn read_result<P: Transceiver>(
        &mut self,
        phy: &mut P,
        addr: EndpointAddress,
        buffer: &mut [u8],
    ) -> Result<usize, UsbError> {
        let endpoint = self.get(addr).ok_or(UsbError::InvalidEndpoint)?;
        if addr.direction() != UsbDirection::Out {
            return Err(UsbError::InvalidEndpoint);
        }
        if endpoint.busy {
            return Err(UsbError::WouldBlock);
        }
        if buffer.len() < endpoint.max_packet as usize {
            return Err(UsbError::BufferOverflow);
        }
        Ok(phy.endpoint_read_result(addr, buffer))
    }

    /// Note a transfer completion reported by the transceiver
    ///
    /// Returns `false` for completions on endpoints that aren't busy, which
    /// are stale and should be dropped.
    pub(crate) fn complete(&mut self, addr: EndpointAddress) -> bool {
        match self.get_mut(addr) {
            Some(endpoint) if endpoint.busy => {
                endpoint.busy = false;
                true
            }
            _ => false,
        }
    }
}
