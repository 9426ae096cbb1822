//! The SPI bus: host context, device slots and the interrupt-queued API.
//!
//! One [`SpiBus`] owns one SPI host. Application tasks call it through a
//! shared reference; the bus interrupt handler calls
//! [`on_interrupt`](SpiBus::on_interrupt) on the same instance. Every piece of
//! state the two contexts share sits in a [`CriticalSectionCell`].
//!
//! # Queue model
//!
//! Each device has a `pending` and a `completed` queue. Its queue depth
//! bounds the transactions in the air (pending + in flight + completed but
//! not retrieved), so the interrupt side can always deliver a result.

use alloc::boxed::Box;

use embedded_hal::delay::DelayNs;

use super::clock::compute_timing;
use super::config::{BusConfig, DeviceConfig};
use super::device::{Device, DeviceHandle, QueueItem, TransactionDesc};
use super::transaction::{TransFlags, Transaction};
use crate::constants::{DEFAULT_RING_SLOTS, MAX_DEVICES, QUEUE_POLL_INTERVAL_US};
use crate::dma::{DescriptorPool, PreparedBuffers};
use crate::error::{Error, Rejected, Result};
use crate::hal::{DmaMemory, SpiHal};
use crate::lock::BusLock;
use crate::sync::{CriticalSectionCell, Timeout, wait_for};

pub(super) type DeviceSlot = CriticalSectionCell<Option<Device>>;

/// Host-wide mutable state.
pub(super) struct HostState<const RING: usize> {
    /// Device currently driving the bus
    pub active: Option<DeviceHandle>,
    /// Transfer started by the dispatcher or a polling call
    pub in_flight: Option<QueueItem>,
    /// A polling transfer owns the hardware
    pub polling: bool,
    /// Device holding ownership through `acquire_bus`
    pub explicit: Option<DeviceHandle>,
    /// Segmented-burst mode is on
    pub burst_mode: bool,
    /// Device that switched burst mode on
    pub burst_owner: Option<DeviceHandle>,
    /// Burst transmit descriptors (configuration buffers and payload)
    pub tx_pool: Box<DescriptorPool<RING>>,
    /// Burst receive descriptors
    pub rx_pool: Box<DescriptorPool<RING>>,
}

impl<const RING: usize> HostState<RING> {
    fn new() -> Self {
        Self {
            active: None,
            in_flight: None,
            polling: false,
            explicit: None,
            burst_mode: false,
            burst_owner: None,
            tx_pool: Box::new(DescriptorPool::new()),
            rx_pool: Box::new(DescriptorPool::new()),
        }
    }
}

/// SPI master transaction engine for one host.
///
/// `RING` sets the number of descriptors in each segmented-burst pool.
///
/// # Example
///
/// ```ignore
/// use ph_esp32_spi::{BusConfig, DeviceConfig, SimpleBusLock, SpiBus, Timeout, Transaction};
///
/// let bus: SpiBus<_, _, _> = SpiBus::new(BusConfig::new(), hal, SimpleBusLock::new(), memory)?;
/// let flash = bus.register_device(DeviceConfig::new(10_000_000).with_queue_size(2))?;
///
/// bus.submit(flash, Transaction::write(vec![0x06]), Timeout::Forever, &mut delay)?;
/// let done = bus.retrieve(flash, Timeout::Forever, &mut delay)?;
///
/// // In the SPI interrupt handler:
/// bus.on_interrupt();
/// ```
pub struct SpiBus<H, L, M, const RING: usize = DEFAULT_RING_SLOTS> {
    pub(super) config: BusConfig,
    pub(super) hal: CriticalSectionCell<H>,
    pub(super) lock: L,
    pub(super) memory: M,
    pub(super) host: CriticalSectionCell<HostState<RING>>,
    pub(super) devices: [DeviceSlot; MAX_DEVICES],
}

impl<H, L, M, const RING: usize> SpiBus<H, L, M, RING>
where
    H: SpiHal,
    L: BusLock,
    M: DmaMemory,
{
    /// Take over a host. The bus interrupt starts masked.
    pub fn new(config: BusConfig, mut hal: H, lock: L, memory: M) -> Result<Self> {
        config.validate()?;
        hal.disable_interrupt();

        #[cfg(feature = "defmt")]
        defmt::info!(
            "spi: bus up, dma={} max_transfer={}",
            config.dma,
            config.effective_max_transfer_size()
        );
        #[cfg(feature = "log")]
        log::info!(
            "spi: bus up, dma={} max_transfer={}",
            config.dma,
            config.effective_max_transfer_size()
        );

        Ok(Self {
            config,
            hal: CriticalSectionCell::new(hal),
            lock,
            memory,
            host: CriticalSectionCell::new(HostState::new()),
            devices: [const { CriticalSectionCell::new(None) }; MAX_DEVICES],
        })
    }

    /// Release the host and hand back the collaborators.
    ///
    /// Fails with `InvalidState` (returning the bus) while any device is
    /// still registered.
    pub fn free(self) -> core::result::Result<(H, L, M), (Error, Self)> {
        if self.devices.iter().any(|slot| slot.with_ref(Option::is_some)) {
            return Err((Error::InvalidState, self));
        }
        let mut hal = self.hal.into_inner();
        hal.disable_interrupt();
        Ok((hal, self.lock, self.memory))
    }

    /// Bus configuration
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The bus lock, for inspection
    pub fn lock(&self) -> &L {
        &self.lock
    }

    /// Largest data phase accepted, in bytes.
    pub fn max_transaction_len(&self) -> usize {
        self.config
            .effective_max_transfer_size()
            .min(self.config.hw_max_bits() / 8)
    }

    /// Free descriptors in the burst transmit and receive pools.
    pub fn burst_descriptors_free(&self) -> (usize, usize) {
        self.host.with_ref(|h| (h.tx_pool.free(), h.rx_pool.free()))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Add a device to the bus.
    ///
    /// Fails with `NotFound` when every chip-select slot is taken and
    /// `NotSupported` when the clock cannot be produced closely enough.
    pub fn register_device(&self, config: DeviceConfig) -> Result<DeviceHandle> {
        config.validate(&self.config)?;

        let dev = self.lock.register_device().ok_or(Error::NotFound)?;
        if dev.index() >= MAX_DEVICES {
            self.lock.unregister_device(dev);
            return Err(Error::NotFound);
        }

        let device = compute_timing(&config, &self.config, dev.index() as u8)
            .and_then(|timing| Device::new(config, timing));
        let device = match device {
            Ok(device) => device,
            Err(e) => {
                self.lock.unregister_device(dev);
                return Err(e);
            }
        };

        #[cfg(any(feature = "defmt", feature = "log"))]
        let freq = device.timing.clock.freq_hz;
        self.devices[dev.index()].with(|slot| *slot = Some(device));

        #[cfg(feature = "defmt")]
        defmt::info!("spi: device {} registered, clock {} Hz", dev.index(), freq);
        #[cfg(feature = "log")]
        log::info!("spi: device {} registered, clock {} Hz", dev.index(), freq);

        Ok(dev)
    }

    /// Remove an idle device.
    ///
    /// Fails with `InvalidState` while the device has queued, in-flight or
    /// unretrieved transactions, holds the bus, or owns burst mode.
    pub fn unregister_device(&self, dev: DeviceHandle) -> Result<()> {
        let slot = self.slot(dev)?;
        let busy = self.host.with_ref(|h| {
            h.active == Some(dev) || h.explicit == Some(dev) || h.burst_owner == Some(dev)
        });
        if busy {
            return Err(Error::InvalidState);
        }

        slot.with(|s| match s {
            None => Err(Error::InvalidArgument),
            Some(d) if !d.is_idle() => Err(Error::InvalidState),
            Some(_) => {
                *s = None;
                Ok(())
            }
        })?;
        self.lock.unregister_device(dev);

        #[cfg(feature = "defmt")]
        defmt::info!("spi: device {} removed", dev.index());
        #[cfg(feature = "log")]
        log::info!("spi: device {} removed", dev.index());
        Ok(())
    }

    /// Clock frequency the device actually runs at, in Hz.
    pub fn actual_freq(&self, dev: DeviceHandle) -> Result<u32> {
        self.with_device(dev, |d| Ok(d.timing.clock.freq_hz))
    }

    // =========================================================================
    // Interrupt-queued transfers
    // =========================================================================

    /// Queue a transaction for the interrupt dispatcher.
    ///
    /// Waits up to `timeout` for room in the device queue. Returns as soon as
    /// the transaction is queued; collect it with [`retrieve`](Self::retrieve).
    pub fn submit<D: DelayNs>(
        &self,
        dev: DeviceHandle,
        trans: Transaction,
        timeout: Timeout,
        delay: &mut D,
    ) -> core::result::Result<(), Rejected> {
        let (burst_mode, polling, explicit) = self.host.with_ref(|h| (h.burst_mode, h.polling, h.explicit));
        if burst_mode {
            return Err(Rejected::new(Error::InvalidState, trans));
        }
        if trans.flags.contains(TransFlags::CS_KEEP_ACTIVE) {
            if polling {
                return Err(Rejected::new(Error::InvalidState, trans));
            }
            if explicit != Some(dev) {
                return Err(Rejected::new(Error::InvalidArgument, trans));
            }
        }

        let desc = self.admit(dev, trans)?;
        if let Err(e) = self.reserve(dev, timeout, delay) {
            return Err(Rejected::new(e, desc.trans));
        }
        self.push_reserved(dev, QueueItem::Transfer(desc)).map_err(|item| {
            let trans = item.into_transfer().map(|desc| desc.trans).unwrap_or_default();
            Rejected::new(Error::InvalidState, trans)
        })
    }

    /// Collect the oldest finished transaction of a device.
    ///
    /// Received data is in place and the DMA result flags are set.
    pub fn retrieve<D: DelayNs>(&self, dev: DeviceHandle, timeout: Timeout, delay: &mut D) -> Result<Transaction> {
        if self.host.with_ref(|h| h.burst_mode) {
            return Err(Error::InvalidState);
        }
        match self.take_completed(dev, false, timeout, delay)? {
            QueueItem::Transfer(desc) => Ok(desc.finish()),
            QueueItem::Burst(_) => Err(Error::InvalidState),
        }
    }

    /// Submit and wait for the result.
    pub fn transmit<D: DelayNs>(&self, dev: DeviceHandle, trans: Transaction, delay: &mut D) -> Result<Transaction> {
        if !self.with_device(dev, |d| Ok(d.returns_results()))? {
            return Err(Error::NotSupported);
        }
        self.submit(dev, trans, Timeout::Forever, delay)?;
        self.retrieve(dev, Timeout::Forever, delay)
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    pub(super) fn slot(&self, dev: DeviceHandle) -> Result<&DeviceSlot> {
        self.devices.get(dev.index()).ok_or(Error::InvalidArgument)
    }

    /// Run `f` on a registered device.
    pub(super) fn with_device<R>(&self, dev: DeviceHandle, f: impl FnOnce(&mut Device) -> Result<R>) -> Result<R> {
        self.slot(dev)?
            .with(|s| s.as_mut().ok_or(Error::InvalidArgument).and_then(f))
    }

    /// Validate a transaction and resolve its buffers.
    pub(super) fn admit(&self, dev: DeviceHandle, mut trans: Transaction) -> core::result::Result<TransactionDesc, Rejected> {
        if let Err(e) = self.with_device(dev, |d| d.validate(&self.config, &mut trans)) {
            return Err(Rejected::new(e, trans));
        }
        let buffers = match PreparedBuffers::prepare(&trans, self.config.dma, &self.memory) {
            Ok(buffers) => buffers,
            Err(e) => return Err(Rejected::new(e, trans)),
        };
        match self.with_device(dev, |d| Ok(d.hw_transaction(&trans, &buffers))) {
            Ok(hw) => Ok(TransactionDesc { trans, buffers, hw }),
            Err(e) => Err(Rejected::new(e, trans)),
        }
    }

    /// Take one slot of the device's queue depth, waiting for room.
    pub(super) fn reserve<D: DelayNs>(&self, dev: DeviceHandle, timeout: Timeout, delay: &mut D) -> Result<()> {
        let slot = self.slot(dev)?;
        wait_for(timeout, QUEUE_POLL_INTERVAL_US, delay, || {
            slot.with(|s| match s.as_mut() {
                None => Some(Err(Error::InvalidArgument)),
                Some(d) => d.reserve().then_some(Ok(())),
            })
        })
        .unwrap_or(Err(Error::Timeout))
    }

    /// Give back a reservation that was never queued.
    pub(super) fn unreserve(&self, dev: DeviceHandle) {
        let _ = self.with_device(dev, |d| {
            d.release();
            Ok(())
        });
    }

    /// Queue an item under an existing reservation and wake the dispatcher.
    pub(super) fn push_reserved(&self, dev: DeviceHandle, item: QueueItem) -> core::result::Result<(), QueueItem> {
        let pushed = match self.slot(dev) {
            Ok(slot) => slot.with(|s| match s.as_mut() {
                Some(d) => d.pending.push(item),
                None => Err(item),
            }),
            Err(_) => Err(item),
        };
        match pushed {
            Ok(()) => {
                self.request_dispatch(dev);
                Ok(())
            }
            Err(item) => {
                self.unreserve(dev);
                Err(item)
            }
        }
    }

    /// Wait for the oldest completed item; `burst` selects which kind the
    /// caller expects at the front.
    pub(super) fn take_completed<D: DelayNs>(
        &self,
        dev: DeviceHandle,
        burst: bool,
        timeout: Timeout,
        delay: &mut D,
    ) -> Result<QueueItem> {
        if !self.with_device(dev, |d| Ok(d.returns_results()))? {
            return Err(Error::NotSupported);
        }
        let slot = self.slot(dev)?;
        wait_for(timeout, QUEUE_POLL_INTERVAL_US, delay, || {
            slot.with(|s| {
                let Some(d) = s.as_mut() else {
                    return Some(Err(Error::InvalidArgument));
                };
                let is_burst = matches!(d.completed.front()?, QueueItem::Burst(_));
                if is_burst != burst {
                    return Some(Err(Error::InvalidState));
                }
                let item = d.completed.pop()?;
                d.release();
                Some(Ok(item))
            })
        })
        .unwrap_or(Err(Error::Timeout))
    }

    /// Flag background work for `dev`, unmasking the interrupt when the
    /// lock says the dispatcher is idle.
    pub(super) fn request_dispatch(&self, dev: DeviceHandle) {
        self.arm_if(|| self.lock.bg_request(dev));
    }

    /// Run a lock call and unmask the interrupt in one critical section.
    pub(super) fn arm_if(&self, f: impl FnOnce() -> bool) {
        critical_section::with(|_| {
            if f() {
                self.hal.with(|h| h.enable_interrupt());
            }
        });
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
