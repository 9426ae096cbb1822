//! Task-context transfers and explicit bus ownership.
//!
//! A polling transfer runs the same start sequence as the dispatcher but
//! from the caller's task, then busy-waits on the done flag. It needs the
//! bus to itself: either the device already holds it through
//! [`acquire_bus`](SpiBus::acquire_bus), or the call takes it for one
//! transaction.

use embedded_hal::delay::DelayNs;

use super::bus::SpiBus;
use super::device::{DeviceHandle, QueueItem};
use super::transaction::{TransFlags, Transaction};
use crate::constants::{DONE_POLL_INTERVAL_US, QUEUE_POLL_INTERVAL_US};
use crate::error::{Error, Rejected, Result};
use crate::hal::{DmaMemory, SpiHal};
use crate::lock::BusLock;
use crate::sync::{Timeout, wait_for};

impl<H, L, M, const RING: usize> SpiBus<H, L, M, RING>
where
    H: SpiHal,
    L: BusLock,
    M: DmaMemory,
{
    /// Take exclusive ownership of the bus for a run of transactions.
    ///
    /// Interrupt-mode transactions of other devices wait until
    /// [`release_bus`](Self::release_bus). Not allowed while a polling
    /// transfer is running.
    pub fn acquire_bus<D: DelayNs>(&self, dev: DeviceHandle, timeout: Timeout, delay: &mut D) -> Result<()> {
        let timing = self.with_device(dev, |d| Ok(d.timing))?;
        let refused = self.host.with_ref(|h| h.polling || h.explicit == Some(dev));
        if refused {
            return Err(Error::InvalidState);
        }

        self.lock.acquire_start(dev, timeout, delay)?;
        self.host.with(|h| h.explicit = Some(dev));

        // Later polling calls find the device already programmed
        if self.lock.touch(dev) {
            self.hal.with(|h| h.setup_device(&timing));
        }
        Ok(())
    }

    /// End ownership taken with [`acquire_bus`](Self::acquire_bus).
    pub fn release_bus(&self, dev: DeviceHandle) -> Result<()> {
        self.host.with(|h| {
            if h.explicit != Some(dev) || h.polling {
                return Err(Error::InvalidState);
            }
            h.explicit = None;
            Ok(())
        })?;
        self.arm_if(|| self.lock.acquire_end(dev));
        Ok(())
    }

    /// Start a transaction from task context.
    ///
    /// Without explicit ownership this takes the bus for the one
    /// transaction; with it, waits for the device's queued interrupt-mode
    /// work to drain first. Finish with [`poll_end`](Self::poll_end).
    pub fn poll_start<D: DelayNs>(
        &self,
        dev: DeviceHandle,
        trans: Transaction,
        timeout: Timeout,
        delay: &mut D,
    ) -> core::result::Result<(), Rejected> {
        let (refused, explicit) = self.host.with_ref(|h| (h.polling || h.burst_mode, h.explicit == Some(dev)));
        if refused {
            return Err(Rejected::new(Error::InvalidState, trans));
        }
        if trans.flags.contains(TransFlags::CS_KEEP_ACTIVE) && !explicit {
            return Err(Rejected::new(Error::InvalidArgument, trans));
        }

        let desc = self.admit(dev, trans)?;
        let slot = match self.slot(dev) {
            Ok(slot) => slot,
            Err(e) => return Err(Rejected::new(e, desc.trans)),
        };

        if !explicit && let Err(e) = self.lock.acquire_start(dev, timeout, delay) {
            #[cfg(feature = "defmt")]
            defmt::warn!("spi: device {} could not take the bus", dev.index());
            #[cfg(feature = "log")]
            log::warn!("spi: device {} could not take the bus", dev.index());
            return Err(Rejected::new(e, desc.trans));
        }

        let claimed = wait_for(timeout, QUEUE_POLL_INTERVAL_US, delay, || {
            critical_section::with(|_| {
                let drained = !explicit || slot.with_ref(|s| s.as_ref().is_some_and(|d| d.pending.is_empty()));
                self.host.with(|h| {
                    if !drained || h.polling || h.active.is_some() {
                        return None;
                    }
                    h.polling = true;
                    h.active = Some(dev);
                    Some(())
                })
            })
        });
        if claimed.is_none() {
            if !explicit {
                self.arm_if(|| self.lock.acquire_end(dev));
            }
            return Err(Rejected::new(Error::Timeout, desc.trans));
        }

        self.start_item(dev, slot, QueueItem::Transfer(desc));
        Ok(())
    }

    /// Wait for the transfer started by [`poll_start`](Self::poll_start).
    ///
    /// On `Timeout` the transfer stays in flight; call again to keep
    /// waiting. On success the bus is released unless the device holds it
    /// explicitly.
    pub fn poll_end<D: DelayNs>(&self, dev: DeviceHandle, timeout: Timeout, delay: &mut D) -> Result<Transaction> {
        if !self.host.with_ref(|h| h.polling && h.active == Some(dev)) {
            return Err(Error::InvalidState);
        }
        wait_for(timeout, DONE_POLL_INTERVAL_US, delay, || {
            self.hal.with_ref(|h| h.is_done()).then_some(())
        })
        .ok_or(Error::Timeout)?;

        let item = self.complete_in_flight().map(|(_, item)| item);
        let explicit = self.host.with(|h| {
            h.polling = false;
            h.active = None;
            h.explicit == Some(dev)
        });

        if explicit {
            let queued = self.with_device(dev, |d| Ok(!d.pending.is_empty())).unwrap_or(false);
            if queued {
                self.request_dispatch(dev);
            }
        } else {
            self.arm_if(|| self.lock.acquire_end(dev));
        }

        item.and_then(QueueItem::into_transfer)
            .map(|desc| desc.finish())
            .ok_or(Error::InvalidState)
    }

    /// [`poll_start`](Self::poll_start) and [`poll_end`](Self::poll_end),
    /// both without a time limit.
    pub fn polling_transmit<D: DelayNs>(&self, dev: DeviceHandle, trans: Transaction, delay: &mut D) -> Result<Transaction> {
        self.poll_start(dev, trans, Timeout::Forever, delay)?;
        self.poll_end(dev, Timeout::Forever, delay)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    extern crate std;
    use std::vec;

    use super::*;
    use crate::driver::config::{BusConfig, DeviceConfig, DeviceFlags};
    use crate::testing::{HalCall, MockDelay, Occupancy, pump, serve_interrupts, test_bus};

    #[test]
    fn polling_transmit_round_trip() {
        let (bus, hal) = test_bus(BusConfig::new());
        let dev = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        hal.set_rx_pattern(&[0xC3]);
        let mut delay = MockDelay::new();

        let done = bus
            .polling_transmit(dev, Transaction::transfer(vec![1, 2, 3, 4], 4), &mut delay)
            .unwrap();
        assert_eq!(done.rx_data(), &[0xC3; 4]);
        assert_eq!(bus.lock.acquiring_device(), None);
        assert!(!hal.irq_enabled());
    }

    #[test]
    fn second_poll_start_is_invalid_state() {
        let (bus, hal) = test_bus(BusConfig::new().with_dma(false));
        let a = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let b = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::new();
        hal.set_auto_complete(false);

        bus.poll_start(a, Transaction::write(vec![0; 4]), Timeout::NoWait, &mut delay)
            .unwrap();
        let r = bus
            .poll_start(b, Transaction::write(vec![0; 4]), Timeout::NoWait, &mut delay)
            .unwrap_err();
        assert_eq!(r.error, Error::InvalidState);

        hal.complete();
        bus.poll_end(a, Timeout::NoWait, &mut delay).unwrap();
        bus.poll_start(b, Transaction::write(vec![0; 4]), Timeout::NoWait, &mut delay)
            .unwrap();
    }

    #[test]
    fn poll_end_times_out_and_keeps_transfer() {
        let (bus, hal) = test_bus(BusConfig::new().with_dma(false));
        let dev = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::new();
        hal.set_auto_complete(false);

        bus.poll_start(dev, Transaction::read_inline(16), Timeout::NoWait, &mut delay)
            .unwrap();
        assert_eq!(bus.poll_end(dev, Timeout::Ticks(1), &mut delay).unwrap_err(), Error::Timeout);
        hal.set_rx_pattern(&[0xAB, 0xCD]);
        hal.complete();
        let done = bus.poll_end(dev, Timeout::NoWait, &mut delay).unwrap();
        assert_eq!(done.rx_data(), &[0xAB, 0xCD]);
    }

    #[test]
    fn poll_end_without_start_is_invalid() {
        let (bus, _) = test_bus(BusConfig::new());
        let dev = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::new();
        assert_eq!(bus.poll_end(dev, Timeout::NoWait, &mut delay).unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn poll_start_blocked_by_other_owner() {
        let (bus, _) = test_bus(BusConfig::new());
        let a = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let b = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::new();

        bus.acquire_bus(a, Timeout::Forever, &mut delay).unwrap();
        let r = bus
            .poll_start(b, Transaction::write(vec![0; 4]), Timeout::Ticks(2), &mut delay)
            .unwrap_err();
        assert_eq!(r.error, Error::Timeout);
        assert_eq!(r.transaction.tx_data(), &[0; 4]);

        bus.release_bus(a).unwrap();
        bus.polling_transmit(b, Transaction::write(vec![0; 4]), &mut delay)
            .unwrap();
    }

    #[test]
    fn acquired_bus_keeps_device_programmed() {
        let (bus, hal) = test_bus(BusConfig::new());
        let dev = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::new();

        bus.acquire_bus(dev, Timeout::Forever, &mut delay).unwrap();
        for _ in 0..3 {
            bus.polling_transmit(dev, Transaction::write(vec![0; 4]), &mut delay)
                .unwrap();
        }
        let setups = hal.calls().iter().filter(|c| matches!(c, HalCall::SetupDevice(_))).count();
        assert_eq!(setups, 1);
        assert_eq!(bus.lock.acquiring_device(), Some(dev));

        assert_eq!(bus.acquire_bus(dev, Timeout::NoWait, &mut delay), Err(Error::InvalidState));
        bus.release_bus(dev).unwrap();
        assert_eq!(bus.release_bus(dev), Err(Error::InvalidState));
    }

    #[test]
    fn keep_cs_active_allowed_under_acquisition() {
        let (bus, hal) = test_bus(BusConfig::new());
        let dev = bus.register_device(DeviceConfig::new(1_000_000).with_flags(DeviceFlags::HALF_DUPLEX)).unwrap();
        let mut delay = MockDelay::new();

        let t = || Transaction::write(vec![0x9F; 4]).with_flags(TransFlags::CS_KEEP_ACTIVE);
        let r = bus.poll_start(dev, t(), Timeout::NoWait, &mut delay).unwrap_err();
        assert_eq!(r.error, Error::InvalidArgument);

        bus.acquire_bus(dev, Timeout::Forever, &mut delay).unwrap();
        bus.polling_transmit(dev, t(), &mut delay).unwrap();
        bus.polling_transmit(dev, Transaction::read(4), &mut delay).unwrap();
        bus.release_bus(dev).unwrap();

        let kept: std::vec::Vec<bool> = hal
            .calls()
            .iter()
            .filter_map(|c| match c {
                HalCall::SetupTransaction(hw) => Some(hw.cs_keep_active),
                _ => None,
            })
            .collect();
        assert_eq!(kept, vec![true, false]);
    }

    #[test]
    fn keep_cs_active_refused_during_polling_transfer() {
        let (bus, hal) = test_bus(BusConfig::new());
        let dev = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::new();
        hal.set_auto_complete(false);

        bus.acquire_bus(dev, Timeout::Forever, &mut delay).unwrap();
        bus.poll_start(dev, Transaction::write(vec![0; 4]), Timeout::NoWait, &mut delay)
            .unwrap();

        let t = Transaction::write(vec![0x5C; 4])
            .with_flags(TransFlags::CS_KEEP_ACTIVE)
            .with_user(3);
        let r = bus.submit(dev, t, Timeout::NoWait, &mut delay).unwrap_err();
        assert_eq!(r.error, Error::InvalidState);
        assert_eq!(r.transaction.tx_data(), &[0x5C; 4]);
        assert_eq!(r.transaction.user, 3);
        assert!(r.transaction.flags.contains(TransFlags::CS_KEEP_ACTIVE));

        hal.complete();
        bus.poll_end(dev, Timeout::NoWait, &mut delay).unwrap();
        bus.release_bus(dev).unwrap();
    }

    #[test]
    fn polling_loop_against_queued_traffic() {
        use std::sync::atomic::{AtomicBool, Ordering};

        const ROUNDS: usize = 1000;
        let (bus, hal) = test_bus(BusConfig::new().with_dma(false));
        let occupancy = Occupancy::new();
        let polled = bus.register_device(occupancy.watch(DeviceConfig::new(1_000_000))).unwrap();
        let queued = bus
            .register_device(occupancy.watch(DeviceConfig::new(2_000_000).with_queue_size(2)))
            .unwrap();
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| serve_interrupts(&bus, &hal, &stop));
            let poller = s.spawn(|| {
                let mut delay = MockDelay::with_hook(std::thread::yield_now);
                for user in 0..ROUNDS {
                    let t = Transaction::write(vec![0xA5; 4]).with_user(user);
                    let done = bus.polling_transmit(polled, t, &mut delay).unwrap();
                    assert_eq!(done.user, user);
                }
            });
            let submitter = s.spawn(|| {
                let mut delay = MockDelay::with_hook(std::thread::yield_now);
                for user in 0..ROUNDS {
                    let t = Transaction::write(vec![0x3C; 4]).with_user(user);
                    bus.submit(queued, t, Timeout::Forever, &mut delay).unwrap();
                    let done = bus.retrieve(queued, Timeout::Forever, &mut delay).unwrap();
                    assert_eq!(done.user, user);
                }
            });
            poller.join().unwrap();
            submitter.join().unwrap();
            stop.store(true, Ordering::Release);
        });

        assert!(!occupancy.overlapped());
        assert_eq!(occupancy.transfers(), 2 * ROUNDS);
        assert_eq!(bus.lock.acquiring_device(), None);
        assert!(bus.host.with_ref(|h| !h.polling && h.active.is_none()));
    }

    #[test]
    fn interrupt_work_resumes_after_polling() {
        let (bus, hal) = test_bus(BusConfig::new());
        let a = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let b = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::new();
        hal.set_auto_complete(false);

        bus.poll_start(a, Transaction::write(vec![0; 4]), Timeout::NoWait, &mut delay)
            .unwrap();
        bus.submit(b, Transaction::write(vec![1; 4]), Timeout::NoWait, &mut delay)
            .unwrap();
        // Held back while `a` owns the bus
        assert!(!hal.irq_enabled());

        hal.complete();
        bus.poll_end(a, Timeout::NoWait, &mut delay).unwrap();
        assert!(hal.irq_enabled());

        hal.set_auto_complete(true);
        pump(&bus, &hal);
        bus.retrieve(b, Timeout::NoWait, &mut delay).unwrap();
    }

    #[test]
    fn explicit_owner_polls_after_its_queue_drains() {
        let (bus, hal) = test_bus(BusConfig::new());
        let dev = bus.register_device(DeviceConfig::new(1_000_000)).unwrap();
        let mut delay = MockDelay::with_hook(|| pump(&bus, &hal));

        bus.acquire_bus(dev, Timeout::Forever, &mut delay).unwrap();
        bus.submit(dev, Transaction::write(vec![1; 4]).with_user(1), Timeout::NoWait, &mut delay)
            .unwrap();
        let done = bus
            .polling_transmit(dev, Transaction::write(vec![2; 4]).with_user(2), &mut delay)
            .unwrap();
        assert_eq!(done.user, 2);
        assert_eq!(bus.retrieve(dev, Timeout::NoWait, &mut delay).unwrap().user, 1);
        bus.release_bus(dev).unwrap();
    }
}
