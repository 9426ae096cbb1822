//! Round-robin bus lock.

use embedded_hal::delay::DelayNs;

use super::{BgExit, BgSelect, BusLock};
use crate::constants::{MAX_DEVICES, QUEUE_POLL_INTERVAL_US};
use crate::driver::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::sync::{CriticalSectionCell, Timeout, wait_for};

#[derive(Debug, Default)]
struct LockState {
    /// Allocated slots
    registered: u8,
    /// Exclusive owner
    acquiring: Option<DeviceHandle>,
    /// Tasks blocked in `acquire_start`
    waiting: u8,
    /// Devices with background work
    requests: u8,
    /// Interrupt armed or handler running
    bg_active: bool,
    /// A dispatched transfer has not completed yet
    in_flight: bool,
    /// A request arrived while the handler was active
    dirty: bool,
    /// Last device picked for background work
    cursor: u8,
    /// Device whose timing is loaded in the hardware
    configured: Option<DeviceHandle>,
}

impl LockState {
    /// Next set bit after the cursor, wrapping.
    fn pick(&self, mask: u8) -> Option<DeviceHandle> {
        (1..=MAX_DEVICES)
            .map(|i| (self.cursor as usize + i) % MAX_DEVICES)
            .find(|&i| mask & (1 << i) != 0)
            .map(|i| DeviceHandle::new(i as u8))
    }

    fn has_request(&self, dev: DeviceHandle) -> bool {
        self.requests & dev.bit() != 0
    }

    fn try_acquire(&mut self, dev: DeviceHandle) -> bool {
        if !self.bg_active {
            match self.acquiring {
                None => self.acquiring = Some(dev),
                Some(owner) if owner == dev => {}
                Some(_) => {
                    self.waiting |= dev.bit();
                    return false;
                }
            }
            self.waiting &= !dev.bit();
            return true;
        }
        self.waiting |= dev.bit();
        false
    }

    fn arm(&mut self) -> bool {
        if self.bg_active {
            false
        } else {
            self.bg_active = true;
            true
        }
    }
}

/// Reference [`BusLock`]: round-robin between devices with background work,
/// exclusive acquisition handed over to waiting tasks first.
///
/// Acquisition is only granted while the dispatcher is idle, so a task that
/// gets the bus never races a running interrupt-mode transfer.
#[derive(Default)]
pub struct SimpleBusLock {
    state: CriticalSectionCell<LockState>,
}

impl SimpleBusLock {
    /// Lock with no devices registered
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the dispatcher is armed or running
    #[must_use]
    pub fn bg_active(&self) -> bool {
        self.state.with_ref(|s| s.bg_active)
    }
}

impl BusLock for SimpleBusLock {
    fn register_device(&self) -> Option<DeviceHandle> {
        self.state.with(|s| {
            let index = (0..MAX_DEVICES).find(|&i| s.registered & (1 << i) == 0)?;
            s.registered |= 1 << index;
            Some(DeviceHandle::new(index as u8))
        })
    }

    fn unregister_device(&self, dev: DeviceHandle) {
        self.state.with(|s| {
            let mask = !dev.bit();
            s.registered &= mask;
            s.waiting &= mask;
            s.requests &= mask;
            if s.acquiring == Some(dev) {
                s.acquiring = None;
            }
            if s.configured == Some(dev) {
                s.configured = None;
            }
        });
    }

    fn acquire_start<D: DelayNs>(&self, dev: DeviceHandle, timeout: Timeout, delay: &mut D) -> Result<()> {
        let granted = wait_for(timeout, QUEUE_POLL_INTERVAL_US, delay, || {
            self.state.with(|s| s.try_acquire(dev).then_some(()))
        });
        if granted.is_some() {
            return Ok(());
        }

        // The handler may have granted ownership after the last check
        self.state.with(|s| {
            if s.acquiring == Some(dev) {
                if !s.bg_active {
                    s.waiting &= !dev.bit();
                    return Ok(());
                }
                s.acquiring = None;
            }
            s.waiting &= !dev.bit();
            Err(Error::Timeout)
        })
    }

    fn acquire_end(&self, dev: DeviceHandle) -> bool {
        self.state.with(|s| {
            if s.acquiring != Some(dev) {
                return false;
            }
            s.acquiring = None;

            if let Some(next) = s.pick(s.waiting) {
                s.waiting &= !next.bit();
                s.acquiring = Some(next);
                return s.has_request(next) && s.arm();
            }
            s.requests != 0 && s.arm()
        })
    }

    fn acquiring_device(&self) -> Option<DeviceHandle> {
        self.state.with_ref(|s| s.acquiring)
    }

    fn bg_request(&self, dev: DeviceHandle) -> bool {
        self.state.with(|s| {
            s.requests |= dev.bit();
            if s.acquiring.is_some_and(|owner| owner != dev) {
                return false;
            }
            if s.bg_active {
                s.dirty = true;
                return false;
            }
            s.arm()
        })
    }

    fn bg_entry(&self) -> bool {
        self.state.with(|s| {
            s.bg_active = true;
            core::mem::take(&mut s.in_flight)
        })
    }

    fn bg_check_dev_acq(&self) -> BgSelect {
        self.state.with(|s| {
            if let Some(owner) = s.acquiring {
                return if s.has_request(owner) {
                    BgSelect::Device(owner)
                } else {
                    BgSelect::Idle
                };
            }
            if let Some(waiter) = s.pick(s.waiting) {
                s.waiting &= !waiter.bit();
                s.acquiring = Some(waiter);
                return if s.has_request(waiter) {
                    BgSelect::Device(waiter)
                } else {
                    BgSelect::Resume
                };
            }
            match s.pick(s.requests) {
                Some(dev) => {
                    s.cursor = dev.index() as u8;
                    BgSelect::Device(dev)
                }
                None => BgSelect::Idle,
            }
        })
    }

    fn bg_check_dev_req(&self, dev: DeviceHandle) -> bool {
        self.state.with_ref(|s| s.has_request(dev))
    }

    fn bg_clear_req(&self, dev: DeviceHandle) {
        self.state.with(|s| s.requests &= !dev.bit());
    }

    fn bg_exit(&self, dispatched: bool) -> BgExit {
        self.state.with(|s| {
            if dispatched {
                s.in_flight = true;
                s.dirty = false;
                return BgExit::Yield;
            }
            if core::mem::take(&mut s.dirty) {
                return BgExit::Continue;
            }
            s.bg_active = false;
            BgExit::Yield
        })
    }

    fn touch(&self, dev: DeviceHandle) -> bool {
        self.state.with(|s| s.configured.replace(dev) != Some(dev))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
