//! Sharing a device with the USB interrupt
//!
//! [`SharedDevice`] keeps a [`Device`] and its [`Class`] behind a critical
//! section mutex, so that the USB interrupt handler and the application can
//! both reach them through a `static`.

use crate::{class::Class, device::Device, phy::Transceiver, CONTROL_BUFFER_SIZE};
use core::cell::RefCell;
use cortex_m::interrupt::Mutex;

#[cfg(not(test))]
use cortex_m::interrupt::free;

/// Host tests have no interrupts to mask
#[cfg(test)]
fn free<R>(func: impl FnOnce(&cortex_m::interrupt::CriticalSection) -> R) -> R {
    // SAFETY: each test owns its device, and nothing runs in interrupt context.
    func(&unsafe { cortex_m::interrupt::CriticalSection::new() })
}

struct Inner<'d, P, C, const SIZE: usize> {
    device: Device<'d, P, SIZE>,
    class: C,
}

/// A device and class, shared between interrupt and thread contexts
///
/// Every access runs in a critical section. Call
/// [`on_interrupt()`](SharedDevice::on_interrupt) from the USB interrupt
/// handler.
pub struct SharedDevice<'d, P, C, const SIZE: usize = CONTROL_BUFFER_SIZE> {
    inner: Mutex<RefCell<Inner<'d, P, C, SIZE>>>,
}

impl<'d, P: Transceiver, C: Class, const SIZE: usize> SharedDevice<'d, P, C, SIZE> {
    /// Wrap an initialized device and its class
    pub fn new(device: Device<'d, P, SIZE>, class: C) -> Self {
        SharedDevice {
            inner: Mutex::new(RefCell::new(Inner { device, class })),
        }
    }

    /// Handle the transceiver's events
    pub fn on_interrupt(&self) {
        self.with_device_mut(|device, class| device.process(class));
    }

    /// Interrupt-safe, immutable access to the device and class
    pub fn with_device<R>(&self, func: impl FnOnce(&Device<'d, P, SIZE>, &C) -> R) -> R {
        free(|cs| {
            let inner = self.inner.borrow(cs);
            let inner = inner.borrow();
            func(&inner.device, &inner.class)
        })
    }

    /// Interrupt-safe, mutable access to the device and class
    pub fn with_device_mut<R>(
        &self,
        func: impl FnOnce(&mut Device<'d, P, SIZE>, &mut C) -> R,
    ) -> R {
        free(|cs| {
            let inner = self.inner.borrow(cs);
            let mut inner = inner.borrow_mut();
            let Inner { device, class } = &mut *inner;
            func(device, class)
        })
    }
}
