//! Centralized Constants
//!
//! Single source of truth for the magic numbers used throughout the SPI
//! master engine.
//!
//! # Organization
//!
//! - **Bus limits**: device slots, FIFO and DMA transfer limits
//! - **Timing**: tick period and polling intervals
//! - **Clock**: source frequencies and divider ranges
//! - **Segmented burst**: descriptor payload and ring sizes
//!
//! # Note
//!
//! The segment configuration buffer word layout lives in
//! `dma::descriptor::bits` next to the descriptor bit fields it is loaded with.

// =============================================================================
// Bus Limits
// =============================================================================

/// Maximum number of devices (chip-select slots) per bus
pub const MAX_DEVICES: usize = 6;

/// Default per-device queue depth
pub const DEFAULT_QUEUE_SIZE: usize = 4;

/// Largest transfer carried in the inline transaction buffers, in bits
pub const INLINE_MAX_BITS: usize = 32;

/// Size of the controller data FIFO in bytes (CPU-driven transfers)
pub const FIFO_SIZE: usize = 64;

/// Default `max_transfer_size` when DMA is enabled, in bytes
pub const DEFAULT_DMA_TRANSFER_SIZE: usize = 4092;

/// Alignment of DMA buffers in internal memory
pub const DMA_INTERNAL_ALIGN: usize = 4;

// =============================================================================
// Timing Constants
// =============================================================================

/// Scheduler tick period in microseconds (one `Timeout::Ticks` unit)
pub const TICK_PERIOD_US: u32 = 1_000;

/// Interval between checks while a task waits on a queue or the bus lock
pub const QUEUE_POLL_INTERVAL_US: u32 = 100;

/// Interval between checks of the hardware done flag in polling mode
pub const DONE_POLL_INTERVAL_US: u32 = 1;

// =============================================================================
// Clock Frequencies
// =============================================================================

/// APB clock frequency in Hz (default SPI source)
pub const APB_CLK_HZ: u32 = 80_000_000;

/// Crystal clock frequency in Hz
pub const XTAL_CLK_HZ: u32 = 40_000_000;

/// Largest clock pre-divider value
pub const CLK_PRE_DIV_MAX: u32 = 8192;

/// Smallest clock counter value (one high, one low phase)
pub const CLK_N_MIN: u32 = 2;

/// Largest clock counter value
pub const CLK_N_MAX: u32 = 64;

/// Default duty cycle (128/256 = 50 %)
pub const DEFAULT_DUTY_CYCLE: u16 = 128;

/// Largest accepted deviation from the requested clock, in parts per thousand
pub const CLK_MAX_ERROR_PERMILLE: u32 = 500;

/// Input delay added by routing signals through the GPIO matrix, in ns
pub const GPIO_MATRIX_DELAY_NS: u32 = 25;

// =============================================================================
// Segmented Burst
// =============================================================================

/// Largest payload carried by one DMA descriptor (4-byte aligned)
pub const DMA_DESC_MAX_PAYLOAD: usize = 4092;

/// Default number of slots in each (TX and RX) descriptor pool
pub const DEFAULT_RING_SLOTS: usize = 32;
