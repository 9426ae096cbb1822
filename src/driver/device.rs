//! Per-device state: configuration, queues and transaction admission.

use alloc::vec::Vec;

use super::clock::DeviceTiming;
use super::config::{BusConfig, DeviceConfig, DeviceFlags, TransferCallback};
use super::transaction::{RxData, Segment, TransFlags, Transaction, TxData};
use crate::constants::INLINE_MAX_BITS;
use crate::dma::{PreparedBuffers, SlotRun};
use crate::error::{Error, Result};
use crate::hal::{HwTransaction, LineMode};
use crate::sync::BoundedQueue;

/// Handle to a registered device: its chip-select slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceHandle(u8);

impl DeviceHandle {
    /// Handle for chip-select slot `index`
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Chip-select slot index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Single-bit mask for slot bitmaps
    #[must_use]
    pub const fn bit(self) -> u8 {
        1 << self.0
    }
}

// =============================================================================
// Queue items
// =============================================================================

/// A plain transaction with its resolved buffers and register image.
pub(crate) struct TransactionDesc {
    pub trans: Transaction,
    pub buffers: PreparedBuffers,
    pub hw: HwTransaction,
}

impl TransactionDesc {
    /// Copy staged receive data back and hand the transaction out.
    pub(crate) fn finish(self) -> Transaction {
        let mut trans = self.trans;
        self.buffers.finalize(&mut trans);
        trans
    }
}

/// A segmented burst: segments, their configuration words and the
/// descriptor runs claimed for it.
pub(crate) struct BurstDesc {
    pub segments: Vec<Segment>,
    pub conf: Vec<[u32; crate::dma::descriptor::bits::conf::WORDS]>,
    pub tx_run: SlotRun,
    pub rx_run: SlotRun,
}

/// Entry of the pending and completed queues.
pub(crate) enum QueueItem {
    Transfer(TransactionDesc),
    Burst(BurstDesc),
}

impl QueueItem {
    pub(crate) fn into_transfer(self) -> Option<TransactionDesc> {
        match self {
            QueueItem::Transfer(desc) => Some(desc),
            QueueItem::Burst(_) => None,
        }
    }

    /// Transaction handed to the transfer callbacks.
    pub(crate) fn callback_view(&self) -> Option<&Transaction> {
        match self {
            QueueItem::Transfer(desc) => Some(&desc.trans),
            QueueItem::Burst(burst) => burst.segments.first().map(|s| &s.base),
        }
    }
}

/// Which transfer callback to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hook {
    Pre,
    Post,
}

// =============================================================================
// Device
// =============================================================================

/// One registered device.
pub(crate) struct Device {
    pub timing: DeviceTiming,
    pub command_bits: u8,
    pub address_bits: u8,
    pub dummy_bits: u8,
    pub flags: DeviceFlags,
    pub queue_size: usize,
    /// Not yet started
    pub pending: BoundedQueue<QueueItem>,
    /// Finished, waiting for retrieval
    pub completed: BoundedQueue<QueueItem>,
    /// Pending + in flight + completed, bounded by `queue_size`
    pub outstanding: usize,
    pub pre_cb: Option<TransferCallback>,
    pub post_cb: Option<TransferCallback>,
}

impl Device {
    pub(crate) fn new(config: DeviceConfig, timing: DeviceTiming) -> Result<Self> {
        Ok(Self {
            timing,
            command_bits: config.command_bits,
            address_bits: config.address_bits,
            dummy_bits: config.dummy_bits,
            flags: config.flags,
            queue_size: config.queue_size,
            pending: BoundedQueue::with_capacity(config.queue_size)?,
            completed: BoundedQueue::with_capacity(config.queue_size)?,
            outstanding: 0,
            pre_cb: config.pre_transfer,
            post_cb: config.post_transfer,
        })
    }

    #[inline]
    pub(crate) fn is_half_duplex(&self) -> bool {
        self.flags.contains(DeviceFlags::HALF_DUPLEX)
    }

    #[inline]
    pub(crate) fn returns_results(&self) -> bool {
        !self.flags.contains(DeviceFlags::NO_RETURN_RESULT)
    }

    pub(crate) fn callback(&mut self, hook: Hook) -> &mut Option<TransferCallback> {
        match hook {
            Hook::Pre => &mut self.pre_cb,
            Hook::Post => &mut self.post_cb,
        }
    }

    /// Take one slot of queue depth.
    pub(crate) fn reserve(&mut self) -> bool {
        if self.outstanding >= self.queue_size {
            return false;
        }
        self.outstanding += 1;
        true
    }

    /// Give back a slot taken by [`reserve`](Self::reserve).
    pub(crate) fn release(&mut self) {
        debug_assert!(self.outstanding > 0);
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Whether nothing is queued, in flight or waiting for retrieval.
    pub(crate) fn is_idle(&self) -> bool {
        self.outstanding == 0 && self.pending.is_empty() && self.completed.is_empty()
    }

    fn phase_bits(&self, trans: &Transaction) -> (u8, u8, u8) {
        let pick = |flag: TransFlags, own: u8, dev: u8| if trans.flags.contains(flag) { own } else { dev };
        (
            pick(TransFlags::VARIABLE_CMD, trans.command_bits, self.command_bits),
            pick(TransFlags::VARIABLE_ADDR, trans.address_bits, self.address_bits),
            pick(TransFlags::VARIABLE_DUMMY, trans.dummy_bits, self.dummy_bits),
        )
    }

    /// Check a transaction against the device and bus, defaulting the
    /// receive length in full-duplex mode.
    pub(crate) fn validate(&self, bus: &BusConfig, trans: &mut Transaction) -> Result<()> {
        let half_duplex = self.is_half_duplex();
        let tx_enabled = trans.has_tx();
        let rx_enabled = trans.has_rx();
        let max_bits = bus.effective_max_transfer_size() * 8;

        if matches!(trans.tx, TxData::Inline(_)) && trans.length > INLINE_MAX_BITS {
            return Err(Error::InvalidArgument);
        }
        if matches!(trans.rx, RxData::Inline(_)) && trans.rx_length > INLINE_MAX_BITS {
            return Err(Error::InvalidArgument);
        }
        if trans.length > max_bits || trans.rx_length > max_bits {
            return Err(Error::InvalidArgument);
        }
        let inline_only = !matches!(trans.tx, TxData::Buffer(_)) && !matches!(trans.rx, RxData::Buffer(_));
        let hw_max = if inline_only { bus.caps.cpu_max_bits } else { bus.hw_max_bits() };
        if trans.length > hw_max || trans.rx_length > hw_max {
            return Err(Error::InvalidArgument);
        }
        if !half_duplex && trans.rx_length > trans.length {
            return Err(Error::InvalidArgument);
        }

        let multi_line = trans.flags.intersects(TransFlags::MULTI_LINE);
        if multi_line && (self.flags.contains(DeviceFlags::THREE_WIRE) || !half_duplex) {
            return Err(Error::InvalidArgument);
        }
        if trans.flags.contains(TransFlags::MODE_OCT) && !bus.caps.octal {
            return Err(Error::NotSupported);
        }
        if half_duplex && tx_enabled && rx_enabled && bus.dma && !bus.caps.hd_dma_both_directions {
            return Err(Error::NotSupported);
        }

        if tx_enabled && trans.length == 0 {
            return Err(Error::InvalidArgument);
        }
        if half_duplex && rx_enabled && trans.rx_length == 0 {
            return Err(Error::InvalidArgument);
        }
        if trans.rx_length == 0 && !half_duplex {
            trans.rx_length = trans.length;
        }

        let (_, _, dummy) = self.phase_bits(trans);
        let extra_dummy = if half_duplex { self.timing.timing_dummy } else { 0 };
        if tx_enabled && rx_enabled && (dummy != 0 || extra_dummy != 0) {
            return Err(Error::InvalidArgument);
        }

        if let TxData::Buffer(buf) = &trans.tx
            && buf.len() < trans.tx_bytes()
        {
            return Err(Error::InvalidArgument);
        }
        if let RxData::Buffer(buf) = &trans.rx
            && buf.len() < trans.rx_bytes()
        {
            return Err(Error::InvalidArgument);
        }

        trans.flags.remove(TransFlags::RESULT);
        Ok(())
    }

    /// Register image for a validated transaction.
    pub(crate) fn hw_transaction(&self, trans: &Transaction, buffers: &PreparedBuffers) -> HwTransaction {
        let (cmd_bits, addr_bits, dummy_bits) = self.phase_bits(trans);
        let half_duplex = self.is_half_duplex();
        let data_lines = if trans.flags.contains(TransFlags::MODE_OCT) {
            LineMode::Octal
        } else if trans.flags.contains(TransFlags::MODE_QIO) {
            LineMode::Quad
        } else if trans.flags.contains(TransFlags::MODE_DIO) {
            LineMode::Dual
        } else {
            LineMode::Single
        };
        let lines_for = |flag: TransFlags| if trans.flags.contains(flag) { data_lines } else { LineMode::Single };
        let extra_dummy = if half_duplex && !self.flags.contains(DeviceFlags::NO_DUMMY) {
            self.timing.timing_dummy as u16
        } else {
            0
        };

        HwTransaction {
            cs_slot: self.timing.cs_slot,
            cmd: trans.cmd,
            cmd_bits,
            addr: trans.addr,
            addr_bits,
            dummy_bits: dummy_bits as u16 + extra_dummy,
            tx_bits: if trans.has_tx() { trans.length } else { 0 },
            rx_bits: if trans.has_rx() { trans.rx_length } else { 0 },
            cmd_lines: lines_for(TransFlags::MULTILINE_CMD),
            addr_lines: lines_for(TransFlags::MULTILINE_ADDR),
            data_lines,
            half_duplex,
            cs_keep_active: trans.flags.contains(TransFlags::CS_KEEP_ACTIVE),
            tx_dma: buffers.tx.is_dma(),
            rx_dma: buffers.rx.is_dma(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
