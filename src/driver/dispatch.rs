//! Interrupt-context dispatcher.
//!
//! One call to [`SpiBus::on_interrupt`] per transfer-done interrupt:
//!
//! 1. finish the transfer in flight, if the lock says one was started
//! 2. ask the lock which device to serve
//! 3. pop that device's oldest pending item, or clear its request and
//!    go back to 2
//! 4. program and start the hardware
//! 5. ask the lock whether to run selection again or leave
//!
//! The interrupt stays unmasked only while a transfer is in flight; an idle
//! dispatcher masks it on the way out.

use super::bus::{DeviceSlot, SpiBus};
use super::device::{DeviceHandle, Hook, QueueItem, TransactionDesc};
use super::transaction::TransFlags;
use crate::dma::{SlotRun, Stage};
use crate::hal::{DmaMemory, SpiHal};
use crate::lock::{BgExit, BgSelect, BusLock};

enum Pull {
    Item(QueueItem),
    Empty,
    Busy,
}

impl<H, L, M, const RING: usize> SpiBus<H, L, M, RING>
where
    H: SpiHal,
    L: BusLock,
    M: DmaMemory,
{
    /// Bus interrupt handler body.
    ///
    /// Never blocks. Call it from the SPI host's interrupt.
    pub fn on_interrupt(&self) {
        if self.lock.bg_entry() {
            self.finish_in_flight();
        }

        loop {
            let dispatched = self.dispatch_next();
            let exit = critical_section::with(|_| {
                let exit = self.lock.bg_exit(dispatched);
                if exit == BgExit::Yield {
                    self.hal.with(|h| {
                        if dispatched {
                            h.enable_interrupt();
                        } else {
                            h.disable_interrupt();
                        }
                    });
                }
                exit
            });
            if exit == BgExit::Yield {
                break;
            }
        }
    }

    /// Select a device and start its next item. Returns whether a transfer
    /// was started.
    fn dispatch_next(&self) -> bool {
        loop {
            let dev = match self.lock.acquiring_device() {
                Some(owner) => owner,
                None => match self.lock.bg_check_dev_acq() {
                    BgSelect::Device(dev) => dev,
                    BgSelect::Resume | BgSelect::Idle => return false,
                },
            };
            if !self.lock.bg_check_dev_req(dev) {
                return false;
            }
            let Ok(slot) = self.slot(dev) else {
                self.lock.bg_clear_req(dev);
                continue;
            };

            let pulled = critical_section::with(|_| {
                if self.host.with_ref(|h| h.polling || h.active.is_some()) {
                    return Pull::Busy;
                }
                match slot.with(|s| s.as_mut().and_then(|d| d.pending.pop())) {
                    Some(item) => {
                        self.host.with(|h| h.active = Some(dev));
                        Pull::Item(item)
                    }
                    None => {
                        self.lock.bg_clear_req(dev);
                        Pull::Empty
                    }
                }
            });

            match pulled {
                Pull::Item(item) => {
                    self.start_item(dev, slot, item);
                    return true;
                }
                Pull::Empty => {}
                Pull::Busy => return false,
            }
        }
    }

    /// Program the hardware for `item` and start it.
    ///
    /// The caller has already made `dev` the active device.
    pub(super) fn start_item(&self, dev: DeviceHandle, slot: &DeviceSlot, mut item: QueueItem) {
        debug_assert!(
            self.host.with_ref(|h| h.active == Some(dev) && h.in_flight.is_none()),
            "hardware started while another transfer owns it"
        );

        if self.lock.touch(dev)
            && let Some(timing) = slot.with_ref(|s| s.as_ref().map(|d| d.timing))
        {
            self.hal.with(|h| h.setup_device(&timing));
        }

        if let QueueItem::Transfer(desc) = &mut item {
            self.hal.with(|h| load_transfer(h, desc));
        }
        self.run_callback(slot, &item, Hook::Pre);

        let chains = match &item {
            QueueItem::Burst(burst) => self
                .host
                .with_ref(|h| h.tx_pool.chain(burst.tx_run).map(|tx| (tx, h.rx_pool.chain(burst.rx_run)))),
            QueueItem::Transfer(_) => None,
        };

        self.host.with(|h| h.in_flight = Some(item));
        self.hal.with(|h| match chains {
            // SAFETY: the chains and their buffers belong to the item now held
            // in `in_flight`, which is only released once the hardware is done
            Some((tx, rx)) => unsafe { h.start_burst(tx, rx) },
            None => h.start(),
        });
    }

    /// Post-process the transfer in flight and hand it back with its device.
    ///
    /// Leaves `active` set; the caller decides where the item goes.
    pub(super) fn complete_in_flight(&self) -> Option<(DeviceHandle, QueueItem)> {
        let (dev, mut item) = self.host.with(|h| Some((h.active?, h.in_flight.take()?)))?;

        match &mut item {
            QueueItem::Transfer(desc) => {
                let status = self.hal.with(|h| {
                    if matches!(desc.buffers.rx, Stage::Fifo) {
                        h.read_fifo(desc.trans.rx_data_mut());
                    }
                    h.fifo_status()
                });
                // External memory could not keep up with the FIFO
                if desc.buffers.rx.is_external() && status.rx_full {
                    desc.trans.flags |= TransFlags::DMA_RX_FAIL;
                }
                if desc.buffers.tx.is_external() && status.tx_empty {
                    desc.trans.flags |= TransFlags::DMA_TX_FAIL;
                }
                desc.buffers.sync_after_receive(&desc.trans, &self.memory);
            }
            QueueItem::Burst(burst) => {
                self.host.with(|h| {
                    h.tx_pool.recycle(burst.tx_run);
                    h.rx_pool.recycle(burst.rx_run);
                });
                burst.tx_run = SlotRun::EMPTY;
                burst.rx_run = SlotRun::EMPTY;
                burst.conf = alloc::vec::Vec::new();
                self.sync_burst(burst);
            }
        }

        if let Ok(slot) = self.slot(dev) {
            self.run_callback(slot, &item, Hook::Post);
        }
        Some((dev, item))
    }

    /// Finish the dispatcher's transfer and deliver it to `completed`.
    fn finish_in_flight(&self) {
        let Some((dev, item)) = self.complete_in_flight() else {
            return;
        };

        let dropped = self.slot(dev).ok().and_then(|slot| {
            slot.with(|s| {
                let d = s.as_mut()?;
                if !d.returns_results() {
                    d.release();
                    return Some(item);
                }
                let rejected = d.completed.push(item).err();
                if rejected.is_some() {
                    d.release();
                }
                rejected
            })
        });
        #[cfg(feature = "log")]
        if dropped.is_some() {
            log::debug!("spi: device {} result dropped", dev.index());
        }
        drop(dropped);

        self.host.with(|h| h.active = None);
    }

    /// Run a transfer callback outside the device's critical section.
    fn run_callback(&self, slot: &DeviceSlot, item: &QueueItem, hook: Hook) {
        let Some(view) = item.callback_view() else {
            return;
        };
        let Some(mut callback) = slot.with(|s| s.as_mut().and_then(|d| d.callback(hook).take())) else {
            return;
        };
        callback(view);
        slot.with(|s| {
            if let Some(d) = s.as_mut() {
                *d.callback(hook) = Some(callback);
            }
        });
    }
}

/// Phases, lengths and data for one plain transfer.
fn load_transfer<H: SpiHal>(hal: &mut H, desc: &mut TransactionDesc) {
    hal.setup_transaction(&desc.hw);

    let tx = desc.buffers.tx_dma(&desc.trans);
    let rx = desc.buffers.rx_dma(&mut desc.trans);
    if tx.is_some() || rx.is_some() {
        hal.reset_dma();
    }

    match tx {
        // SAFETY: the buffer is owned by `desc`, which stays in flight until
        // the transfer is done
        Some((ptr, len)) => unsafe { hal.load_tx_dma(ptr, len) },
        None if matches!(desc.buffers.tx, Stage::Fifo) => hal.write_fifo(desc.trans.tx_data()),
        None => {}
    }
    if let Some((ptr, len)) = rx {
        // SAFETY: as above; nothing else touches the receive area meanwhile
        unsafe { hal.load_rx_dma(ptr, len) };
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
