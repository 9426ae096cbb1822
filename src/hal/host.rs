//! SPI controller operations.

use crate::dma::DescriptorChain;
use crate::driver::clock::DeviceTiming;

/// Number of lines a phase is clocked over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LineMode {
    /// One line (MOSI/MISO)
    #[default]
    Single = 1,
    /// Two lines
    Dual = 2,
    /// Four lines
    Quad = 4,
    /// Eight lines
    Octal = 8,
}

/// Per-transfer register image.
///
/// Built by the engine from a validated transaction and the device defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HwTransaction {
    /// Chip-select slot to assert
    pub cs_slot: u8,
    /// Command value
    pub cmd: u16,
    /// Command phase width
    pub cmd_bits: u8,
    /// Address value
    pub addr: u64,
    /// Address phase width
    pub addr_bits: u8,
    /// Dummy cycles, including input-delay compensation
    pub dummy_bits: u16,
    /// Data-out length in bits (0 skips the phase)
    pub tx_bits: usize,
    /// Data-in length in bits (0 skips the phase)
    pub rx_bits: usize,
    /// Lines used by the command phase
    pub cmd_lines: LineMode,
    /// Lines used by the address phase
    pub addr_lines: LineMode,
    /// Lines used by the data phases
    pub data_lines: LineMode,
    /// Phases run sequentially rather than concurrently
    pub half_duplex: bool,
    /// Chip select stays asserted after the transfer
    pub cs_keep_active: bool,
    /// Data-out phase is fed by DMA
    pub tx_dma: bool,
    /// Data-in phase is drained by DMA
    pub rx_dma: bool,
}

/// FIFO interrupt-raw bits read back after a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FifoStatus {
    /// Receive FIFO filled up before DMA drained it
    pub rx_full: bool,
    /// Transmit FIFO ran empty before DMA refilled it
    pub tx_empty: bool,
}

/// Register-level operations on one SPI host.
///
/// Implementations must not block. Methods are called from task context
/// (polling mode, configuration) or from the bus interrupt handler, never
/// both at once: the engine serializes access.
pub trait SpiHal {
    /// Program clock, mode, bit order and chip-select timing for a device.
    fn setup_device(&mut self, timing: &DeviceTiming);

    /// Program phases and lengths for the next transfer.
    fn setup_transaction(&mut self, trans: &HwTransaction);

    /// Reset both DMA channels.
    fn reset_dma(&mut self);

    /// Point the transmit DMA channel at `len` bytes.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and unmodified until the transfer is done.
    unsafe fn load_tx_dma(&mut self, buf: *const u8, len: usize);

    /// Point the receive DMA channel at `len` bytes.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and otherwise unaccessed until the transfer is
    /// done.
    unsafe fn load_rx_dma(&mut self, buf: *mut u8, len: usize);

    /// Copy data-out bytes into the controller FIFO.
    fn write_fifo(&mut self, data: &[u8]);

    /// Copy data-in bytes out of the controller FIFO.
    fn read_fifo(&mut self, data: &mut [u8]);

    /// Clear the done flag and trigger the user transfer.
    fn start(&mut self);

    /// Whether the last user transfer has finished.
    ///
    /// Stays set until the next [`start`](Self::start); the transfer-done
    /// interrupt is level-triggered on it while unmasked.
    fn is_done(&self) -> bool;

    /// FIFO overrun/underrun indicators for the last transfer.
    fn fifo_status(&self) -> FifoStatus;

    /// Unmask the transfer-done interrupt.
    fn enable_interrupt(&mut self);

    /// Mask the transfer-done interrupt.
    fn disable_interrupt(&mut self);

    /// Switch segmented-burst (configurable segment transfer) mode.
    fn enable_burst(&mut self, enable: bool);

    /// Start a burst from linked descriptor chains.
    ///
    /// # Safety
    ///
    /// The chains and every buffer they reference must stay valid until the
    /// burst is done.
    unsafe fn start_burst(&mut self, tx: DescriptorChain, rx: Option<DescriptorChain>);
}
