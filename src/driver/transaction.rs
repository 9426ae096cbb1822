//! Transaction request types.
//!
//! A [`Transaction`] owns its data buffers for its whole life: the caller
//! builds it, hands it to the bus, and gets it back (with received data and
//! result flags filled in) on retrieval.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::constants::INLINE_MAX_BITS;

bitflags! {
    /// Per-transaction flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransFlags: u32 {
        /// Data phase on 2 lines
        const MODE_DIO = 1 << 0;
        /// Data phase on 4 lines
        const MODE_QIO = 1 << 1;
        /// Data phase on 8 lines
        const MODE_OCT = 1 << 2;
        /// Command phase uses the data-phase line count
        const MULTILINE_CMD = 1 << 3;
        /// Address phase uses the data-phase line count
        const MULTILINE_ADDR = 1 << 4;
        /// Use `command_bits` from the transaction instead of the device
        const VARIABLE_CMD = 1 << 5;
        /// Use `address_bits` from the transaction instead of the device
        const VARIABLE_ADDR = 1 << 6;
        /// Use `dummy_bits` from the transaction instead of the device
        const VARIABLE_DUMMY = 1 << 7;
        /// Keep chip select asserted after this transfer
        const CS_KEEP_ACTIVE = 1 << 8;
        /// Buffers are already DMA-ready; never bounce them
        const DMA_BUFFER_ALIGN_MANUAL = 1 << 9;
        /// Buffers live in external memory (PSRAM)
        const DMA_USE_PSRAM = 1 << 10;
        /// Result: receive FIFO overran while DMA fed from external memory
        const DMA_RX_FAIL = 1 << 11;
        /// Result: transmit FIFO underran while DMA fed from external memory
        const DMA_TX_FAIL = 1 << 12;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for TransFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "TransFlags({=u32:#x})", self.bits());
    }
}

impl TransFlags {
    /// Flags the engine sets on completion; ignored on submission.
    pub const RESULT: TransFlags = TransFlags::DMA_RX_FAIL.union(TransFlags::DMA_TX_FAIL);

    /// Multi-line data modes.
    pub const MULTI_LINE: TransFlags = TransFlags::MODE_DIO
        .union(TransFlags::MODE_QIO)
        .union(TransFlags::MODE_OCT);
}

/// Data sent during the data-out phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TxData {
    /// No data-out phase
    #[default]
    None,
    /// Up to 32 bits carried inside the transaction
    Inline([u8; 4]),
    /// Caller-owned buffer
    Buffer(Vec<u8>),
}

/// Destination of the data-in phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RxData {
    /// No data-in phase
    #[default]
    None,
    /// Up to 32 bits received into the transaction
    Inline([u8; 4]),
    /// Caller-owned buffer
    Buffer(Vec<u8>),
}

/// One SPI transaction.
///
/// Lengths are in bits. A zero `rx_length` in full-duplex mode means "same as
/// `length`".
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    /// Flag bits (see [`TransFlags`])
    pub flags: TransFlags,
    /// Command value, sent in the command phase
    pub cmd: u16,
    /// Address value, sent in the address phase
    pub addr: u64,
    /// Total data length in bits
    pub length: usize,
    /// Received data length in bits
    pub rx_length: usize,
    /// Command phase width when `VARIABLE_CMD` is set
    pub command_bits: u8,
    /// Address phase width when `VARIABLE_ADDR` is set
    pub address_bits: u8,
    /// Dummy phase width when `VARIABLE_DUMMY` is set
    pub dummy_bits: u8,
    /// Data to send
    pub tx: TxData,
    /// Where to receive
    pub rx: RxData,
    /// Free-form caller context, visible to the transfer callbacks
    pub user: usize,
}

impl Transaction {
    /// Empty transaction (command/address phases only).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flags: TransFlags::empty(),
            cmd: 0,
            addr: 0,
            length: 0,
            rx_length: 0,
            command_bits: 0,
            address_bits: 0,
            dummy_bits: 0,
            tx: TxData::None,
            rx: RxData::None,
            user: 0,
        }
    }

    /// Send-only transaction from an owned buffer.
    #[must_use]
    pub fn write(data: Vec<u8>) -> Self {
        Self {
            length: data.len() * 8,
            tx: TxData::Buffer(data),
            ..Self::new()
        }
    }

    /// Receive-only transaction of `len` bytes.
    #[must_use]
    pub fn read(len: usize) -> Self {
        Self {
            length: len * 8,
            rx_length: len * 8,
            rx: RxData::Buffer(vec![0; len]),
            ..Self::new()
        }
    }

    /// Send `data` while receiving `rx_len` bytes.
    #[must_use]
    pub fn transfer(data: Vec<u8>, rx_len: usize) -> Self {
        Self {
            length: data.len() * 8,
            rx_length: rx_len * 8,
            tx: TxData::Buffer(data),
            rx: RxData::Buffer(vec![0; rx_len]),
            ..Self::new()
        }
    }

    /// Send up to four bytes from the inline buffer.
    ///
    /// Bytes beyond the fourth are ignored.
    #[must_use]
    pub fn write_inline(data: &[u8]) -> Self {
        let len = data.len().min(INLINE_MAX_BITS / 8);
        let mut inline = [0u8; 4];
        inline[..len].copy_from_slice(&data[..len]);
        Self {
            length: len * 8,
            tx: TxData::Inline(inline),
            ..Self::new()
        }
    }

    /// Receive up to 32 bits into the inline buffer.
    #[must_use]
    pub fn read_inline(bits: usize) -> Self {
        Self {
            length: bits,
            rx_length: bits,
            rx: RxData::Inline([0; 4]),
            ..Self::new()
        }
    }

    /// Set the command value
    #[must_use]
    pub fn with_cmd(mut self, cmd: u16) -> Self {
        self.cmd = cmd;
        self
    }

    /// Set the address value
    #[must_use]
    pub fn with_addr(mut self, addr: u64) -> Self {
        self.addr = addr;
        self
    }

    /// Add flag bits
    #[must_use]
    pub fn with_flags(mut self, flags: TransFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Set the caller context word
    #[must_use]
    pub fn with_user(mut self, user: usize) -> Self {
        self.user = user;
        self
    }

    /// Override the device's command/address/dummy widths for this call
    #[must_use]
    pub fn with_phase_bits(mut self, command: u8, address: u8, dummy: u8) -> Self {
        self.command_bits = command;
        self.address_bits = address;
        self.dummy_bits = dummy;
        self.flags |= TransFlags::VARIABLE_CMD | TransFlags::VARIABLE_ADDR | TransFlags::VARIABLE_DUMMY;
        self
    }

    /// Whether a data-out phase is present
    #[inline]
    #[must_use]
    pub fn has_tx(&self) -> bool {
        !matches!(self.tx, TxData::None)
    }

    /// Whether a data-in phase is present
    #[inline]
    #[must_use]
    pub fn has_rx(&self) -> bool {
        !matches!(self.rx, RxData::None)
    }

    /// Bytes covered by `length`
    #[inline]
    #[must_use]
    pub fn tx_bytes(&self) -> usize {
        self.length.div_ceil(8)
    }

    /// Bytes covered by `rx_length`
    #[inline]
    #[must_use]
    pub fn rx_bytes(&self) -> usize {
        self.rx_length.div_ceil(8)
    }

    /// Data to send, trimmed to `length`.
    #[must_use]
    pub fn tx_data(&self) -> &[u8] {
        let len = self.tx_bytes();
        match &self.tx {
            TxData::None => &[],
            TxData::Inline(bytes) => &bytes[..len.min(4)],
            TxData::Buffer(buf) => &buf[..len.min(buf.len())],
        }
    }

    /// Received data, trimmed to `rx_length`.
    #[must_use]
    pub fn rx_data(&self) -> &[u8] {
        let len = self.rx_bytes();
        match &self.rx {
            RxData::None => &[],
            RxData::Inline(bytes) => &bytes[..len.min(4)],
            RxData::Buffer(buf) => &buf[..len.min(buf.len())],
        }
    }

    /// Mutable receive area, trimmed to `rx_length`.
    pub(crate) fn rx_data_mut(&mut self) -> &mut [u8] {
        let len = self.rx_bytes();
        match &mut self.rx {
            RxData::None => &mut [],
            RxData::Inline(bytes) => &mut bytes[..len.min(4)],
            RxData::Buffer(buf) => {
                let len = len.min(buf.len());
                &mut buf[..len]
            }
        }
    }

    /// Whether DMA reported a FIFO overrun or underrun for this transfer
    #[inline]
    #[must_use]
    pub fn dma_failed(&self) -> bool {
        self.flags.intersects(TransFlags::RESULT)
    }
}

/// One segment of a segmented burst.
///
/// The base transaction carries data and phase settings; the extra fields
/// control chip-select timing around this segment only.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    /// Segment payload and phases
    pub base: Transaction,
    /// Chip-select setup cycles before this segment
    pub cs_setup: u8,
    /// Chip-select hold cycles after this segment
    pub cs_hold: u8,
    /// Idle clock cycles inserted before the next segment
    pub gap_cycles: u8,
}

impl Segment {
    /// Segment with default timing
    #[must_use]
    pub fn new(base: Transaction) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    /// Set chip-select setup/hold cycles for this segment
    #[must_use]
    pub fn with_cs_timing(mut self, setup: u8, hold: u8) -> Self {
        self.cs_setup = setup;
        self.cs_hold = hold;
        self
    }

    /// Set the idle gap before the next segment
    #[must_use]
    pub fn with_gap(mut self, cycles: u8) -> Self {
        self.gap_cycles = cycles;
        self
    }
}
