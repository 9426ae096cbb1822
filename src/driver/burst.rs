//! Segmented-burst mode.
//!
//! A burst runs several segments back to back from one DMA start. Each
//! segment gets a configuration buffer the hardware loads into its user
//! registers, followed by its payload descriptors. All transmit descriptors
//! form one chain, all receive descriptors another, both claimed from the
//! bus-wide pools when the burst is queued and recycled when it completes.
//!
//! Bursts complete in queue order, and only the device that switched the
//! mode on may queue them, so descriptor runs always return to the pools in
//! the order they were claimed.

use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;

use super::bus::SpiBus;
use super::device::{BurstDesc, DeviceHandle, QueueItem};
use super::transaction::{RxData, Segment, TxData};
use crate::constants::DMA_DESC_MAX_PAYLOAD;
use crate::dma::descriptor::bits::conf;
use crate::dma::{PreparedBuffers, dma_ready};
use crate::error::{Error, Rejected, Result};
use crate::hal::{DmaMemory, HwTransaction, SpiHal};
use crate::lock::BusLock;
use crate::sync::Timeout;

type ConfWords = [u32; conf::WORDS];

/// Size of one configuration buffer in bytes
const CONF_BYTES: usize = conf::WORDS * 4;

/// Configuration buffer for one segment.
fn segment_conf(hw: &HwTransaction, seg: &Segment, last: bool) -> ConfWords {
    let mut words = [0; conf::WORDS];
    words[conf::BITMAP] = conf::BITMAP_ALL;
    words[conf::COMMAND] = hw.cmd as u32;
    words[conf::ADDRESS_LO] = hw.addr as u32;
    words[conf::ADDRESS_HI] = (hw.addr >> 32) as u32;
    words[conf::PHASES] = ((hw.cmd_bits as u32) << conf::PHASE_CMD_SHIFT)
        | ((hw.addr_bits as u32) << conf::PHASE_ADDR_SHIFT)
        | ((hw.dummy_bits.min(0xFF) as u32) << conf::PHASE_DUMMY_SHIFT)
        | ((hw.data_lines as u32) << conf::PHASE_LINES_SHIFT);
    words[conf::DATA_BITS] = (hw.tx_bits as u32 & 0xFFFF) | ((hw.rx_bits as u32) << 16);
    words[conf::TIMING] = ((seg.cs_setup as u32) << conf::TIMING_SETUP_SHIFT)
        | ((seg.cs_hold as u32) << conf::TIMING_HOLD_SHIFT)
        | ((seg.gap_cycles as u32) << conf::TIMING_GAP_SHIFT);

    let mut ctrl = 0;
    if hw.tx_bits > 0 {
        ctrl |= conf::CTRL_MOSI;
    }
    if hw.rx_bits > 0 {
        ctrl |= conf::CTRL_MISO;
    }
    if hw.cs_keep_active {
        ctrl |= conf::CTRL_CS_KEEP;
    }
    if last {
        ctrl |= conf::CTRL_EOF;
    }
    words[conf::CTRL] = ctrl;
    words
}

#[inline]
fn payload_slots(len: usize) -> usize {
    len.div_ceil(DMA_DESC_MAX_PAYLOAD)
}

impl<H, L, M, const RING: usize> SpiBus<H, L, M, RING>
where
    H: SpiHal,
    L: BusLock,
    M: DmaMemory,
{
    /// Switch the bus into or out of segmented-burst mode.
    ///
    /// Only half-duplex devices on a DMA bus whose host supports bursts may
    /// do this, and only while nothing is queued anywhere on the bus and no
    /// device holds it through `acquire_bus`. While the mode is on, plain
    /// transactions are refused.
    pub fn enable_burst_mode<D: DelayNs>(&self, dev: DeviceHandle, enable: bool, delay: &mut D) -> Result<()> {
        let (half_duplex, timing) = self.with_device(dev, |d| Ok((d.is_half_duplex(), d.timing)))?;
        if !half_duplex {
            return Err(Error::InvalidState);
        }
        if !self.config.caps.burst_mode || !self.config.dma {
            return Err(Error::NotSupported);
        }

        if !enable {
            let owner = self.host.with_ref(|h| h.burst_mode && h.burst_owner == Some(dev));
            if !owner || !self.with_device(dev, |d| Ok(d.is_idle()))? {
                return Err(Error::InvalidState);
            }
            self.hal.with(|h| h.enable_burst(false));
            self.host.with(|h| {
                h.burst_mode = false;
                h.burst_owner = None;
            });
            #[cfg(feature = "defmt")]
            defmt::info!("spi: burst mode off");
            #[cfg(feature = "log")]
            log::info!("spi: burst mode off");
            return Ok(());
        }

        if self.host.with_ref(|h| h.polling || h.burst_mode || h.active.is_some() || h.explicit.is_some()) {
            return Err(Error::InvalidState);
        }
        let idle = self
            .devices
            .iter()
            .all(|slot| slot.with_ref(|s| s.as_ref().is_none_or(|d| d.is_idle())));
        if !idle {
            return Err(Error::InvalidState);
        }

        self.lock.acquire_start(dev, Timeout::Forever, delay)?;
        self.lock.touch(dev);
        self.hal.with(|h| {
            h.setup_device(&timing);
            // Latches the device setup without running a transfer
            h.setup_transaction(&HwTransaction {
                cs_slot: timing.cs_slot,
                half_duplex: true,
                ..HwTransaction::default()
            });
            h.enable_burst(true);
        });
        self.host.with(|h| {
            h.tx_pool.reset();
            h.rx_pool.reset();
            h.burst_mode = true;
            h.burst_owner = Some(dev);
        });
        self.arm_if(|| self.lock.acquire_end(dev));

        #[cfg(feature = "defmt")]
        defmt::info!("spi: burst mode on for device {}", dev.index());
        #[cfg(feature = "log")]
        log::info!("spi: burst mode on for device {}", dev.index());
        Ok(())
    }

    /// Queue a burst of segments.
    ///
    /// Payload buffers must already be DMA-capable and aligned. Fails with
    /// `NoMemory`, leaving the pools untouched, when not enough descriptors
    /// are free; retry once earlier bursts have completed.
    pub fn queue_burst<D: DelayNs>(
        &self,
        dev: DeviceHandle,
        mut segments: Vec<Segment>,
        timeout: Timeout,
        delay: &mut D,
    ) -> core::result::Result<(), Rejected<Vec<Segment>>> {
        if !self.host.with_ref(|h| h.burst_mode && h.burst_owner == Some(dev)) {
            return Err(Rejected::new(Error::InvalidState, segments));
        }
        let conf = match self.burst_conf(dev, &mut segments) {
            Ok(conf) => conf,
            Err(e) => return Err(Rejected::new(e, segments)),
        };
        if let Err(e) = self.reserve(dev, timeout, delay) {
            return Err(Rejected::new(e, segments));
        }

        let tx_slots: usize = segments
            .iter()
            .map(|s| 1 + payload_slots(s.base.tx_data().len()))
            .sum();
        let rx_slots: usize = segments.iter().map(|s| payload_slots(s.base.rx_data().len())).sum();

        let runs = self.host.with(|h| {
            if h.tx_pool.free() < tx_slots || h.rx_pool.free() < rx_slots {
                return None;
            }
            Some((h.tx_pool.claim(tx_slots)?, h.rx_pool.claim(rx_slots)?))
        });
        let Some((tx_run, rx_run)) = runs else {
            self.unreserve(dev);
            #[cfg(feature = "log")]
            log::warn!("spi: burst needs {} tx / {} rx descriptors", tx_slots, rx_slots);
            return Err(Rejected::new(Error::NoMemory, segments));
        };

        for seg in &segments {
            let data = seg.base.tx_data();
            if !data.is_empty() && self.memory.is_cached(data.as_ptr() as usize) {
                self.memory.writeback(data.as_ptr() as usize, data.len());
            }
        }
        if self.memory.is_cached(conf.as_ptr() as usize) {
            self.memory.writeback(conf.as_ptr() as usize, conf.len() * CONF_BYTES);
        }

        self.host.with(|h| {
            let (mut t, mut r) = (0, 0);
            let mut push_tx = |ptr: *const u8, len: usize| {
                let eof = t + 1 == tx_run.count;
                h.tx_pool.slot(tx_run, t).prepare(ptr, len, len, eof);
                t += 1;
            };
            for (seg, words) in segments.iter_mut().zip(&conf) {
                push_tx(words.as_ptr().cast(), CONF_BYTES);
                for chunk in seg.base.tx_data().chunks(DMA_DESC_MAX_PAYLOAD) {
                    push_tx(chunk.as_ptr(), chunk.len());
                }
                for chunk in seg.base.rx_data_mut().chunks_mut(DMA_DESC_MAX_PAYLOAD) {
                    h.rx_pool.slot(rx_run, r).prepare(chunk.as_mut_ptr(), chunk.len(), 0, false);
                    r += 1;
                }
            }
            h.tx_pool.link(tx_run);
            h.rx_pool.link(rx_run);
        });

        let burst = BurstDesc {
            segments,
            conf,
            tx_run,
            rx_run,
        };
        self.push_reserved(dev, QueueItem::Burst(burst)).map_err(|item| {
            let segments = match item {
                QueueItem::Burst(burst) => burst.segments,
                QueueItem::Transfer(_) => Vec::new(),
            };
            Rejected::new(Error::InvalidState, segments)
        })
    }

    /// Collect the oldest completed burst and its segments.
    pub fn retrieve_burst<D: DelayNs>(&self, dev: DeviceHandle, timeout: Timeout, delay: &mut D) -> Result<Vec<Segment>> {
        match self.take_completed(dev, true, timeout, delay)? {
            QueueItem::Burst(burst) => Ok(burst.segments),
            QueueItem::Transfer(_) => Err(Error::InvalidState),
        }
    }

    /// Validate every segment and build its configuration buffer.
    fn burst_conf(&self, dev: DeviceHandle, segments: &mut [Segment]) -> Result<Vec<ConfWords>> {
        if segments.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut words = Vec::new();
        words.try_reserve_exact(segments.len()).map_err(|_| Error::NoMemory)?;
        let last = segments.len() - 1;

        self.with_device(dev, |d| {
            for (i, seg) in segments.iter_mut().enumerate() {
                d.validate(&self.config, &mut seg.base)?;
                let trans = &seg.base;
                if matches!(trans.tx, TxData::Inline(_)) || matches!(trans.rx, RxData::Inline(_)) {
                    return Err(Error::InvalidArgument);
                }
                let ready = |data: &[u8]| data.is_empty() || dma_ready(data, trans.flags, &self.memory);
                if !ready(trans.tx_data()) || !ready(trans.rx_data()) {
                    return Err(Error::InvalidArgument);
                }
                let hw = d.hw_transaction(trans, &PreparedBuffers::NONE);
                if hw.tx_bits > u16::MAX as usize || hw.rx_bits > u16::MAX as usize {
                    return Err(Error::InvalidArgument);
                }
                words.push(segment_conf(&hw, seg, i == last));
            }
            Ok(())
        })?;
        Ok(words)
    }

    /// Make a finished burst's received data visible to the CPU.
    pub(super) fn sync_burst(&self, burst: &BurstDesc) {
        for seg in &burst.segments {
            let data = seg.base.rx_data();
            let addr = data.as_ptr() as usize;
            if !data.is_empty() && self.memory.is_cached(addr) {
                self.memory.invalidate(addr, data.len());
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
