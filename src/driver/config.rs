//! Bus and device configuration

use alloc::boxed::Box;

use bitflags::bitflags;
use embedded_hal::spi::{MODE_0, Mode};

use super::transaction::Transaction;
use crate::constants::{
    APB_CLK_HZ, DEFAULT_DMA_TRANSFER_SIZE, DEFAULT_DUTY_CYCLE, DEFAULT_QUEUE_SIZE, FIFO_SIZE,
    XTAL_CLK_HZ,
};
use crate::error::{Error, Result};

// =============================================================================
// Host capabilities
// =============================================================================

/// What a particular SPI host variant can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostCaps {
    /// Longest DMA-driven data phase, in bits
    pub dma_max_bits: usize,
    /// Longest CPU-driven (FIFO) data phase, in bits
    pub cpu_max_bits: usize,
    /// Half-duplex transfers may send and receive in one transaction with DMA
    pub hd_dma_both_directions: bool,
    /// Segmented-burst mode exists
    pub burst_mode: bool,
    /// 8-line data mode exists
    pub octal: bool,
    /// Full-duplex devices with command/address phases allow at most one
    /// chip-select setup cycle
    pub fd_cs_setup_limited: bool,
}

impl HostCaps {
    /// Classic ESP32 general-purpose SPI host
    pub const ESP32: HostCaps = HostCaps {
        dma_max_bits: 1 << 24,
        cpu_max_bits: FIFO_SIZE * 8,
        hd_dma_both_directions: false,
        burst_mode: false,
        octal: false,
        fd_cs_setup_limited: true,
    };

    /// ESP32-P4 general-purpose SPI host
    pub const ESP32P4: HostCaps = HostCaps {
        dma_max_bits: 1 << 18,
        cpu_max_bits: FIFO_SIZE * 8,
        hd_dma_both_directions: true,
        burst_mode: true,
        octal: true,
        fd_cs_setup_limited: false,
    };

    /// Capabilities of the chip selected by cargo features
    #[must_use]
    pub const fn current() -> HostCaps {
        #[cfg(feature = "esp32p4")]
        {
            HostCaps::ESP32P4
        }
        #[cfg(not(feature = "esp32p4"))]
        {
            HostCaps::ESP32
        }
    }
}

impl Default for HostCaps {
    fn default() -> Self {
        Self::current()
    }
}

// =============================================================================
// Bus configuration
// =============================================================================

/// Per-bus configuration, fixed for the life of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// Data phases travel through DMA (inline buffers always use the FIFO)
    pub dma: bool,
    /// Largest transfer in bytes; 0 picks the default for the DMA setting
    pub max_transfer_size: usize,
    /// Signals are routed through the GPIO matrix instead of IO_MUX
    pub gpio_matrix: bool,
    /// Host variant capabilities
    pub caps: HostCaps,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConfig {
    /// DMA enabled, default transfer size, IO_MUX routing
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dma: true,
            max_transfer_size: 0,
            gpio_matrix: false,
            caps: HostCaps::current(),
        }
    }

    /// Enable or disable DMA
    #[must_use]
    pub const fn with_dma(mut self, enabled: bool) -> Self {
        self.dma = enabled;
        self
    }

    /// Set the largest transfer size in bytes
    #[must_use]
    pub const fn with_max_transfer_size(mut self, bytes: usize) -> Self {
        self.max_transfer_size = bytes;
        self
    }

    /// Mark the signals as routed through the GPIO matrix
    #[must_use]
    pub const fn with_gpio_matrix(mut self, routed: bool) -> Self {
        self.gpio_matrix = routed;
        self
    }

    /// Override the host capabilities
    #[must_use]
    pub const fn with_caps(mut self, caps: HostCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Transfer size limit in bytes after applying defaults
    #[must_use]
    pub const fn effective_max_transfer_size(&self) -> usize {
        match (self.max_transfer_size, self.dma) {
            (0, true) => DEFAULT_DMA_TRANSFER_SIZE,
            (0, false) => FIFO_SIZE,
            (n, _) => n,
        }
    }

    /// Hardware limit on the data phase length, in bits
    #[must_use]
    pub const fn hw_max_bits(&self) -> usize {
        if self.dma {
            self.caps.dma_max_bits
        } else {
            self.caps.cpu_max_bits
        }
    }

    /// Check the configuration against the host capabilities
    pub fn validate(&self) -> Result<()> {
        if self.effective_max_transfer_size() * 8 > self.hw_max_bits() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

// =============================================================================
// Device configuration
// =============================================================================

bitflags! {
    /// Per-device flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// Transmit least-significant bit first
        const TX_LSB_FIRST = 1 << 0;
        /// Receive least-significant bit first
        const RX_LSB_FIRST = 1 << 1;
        /// Both directions least-significant bit first
        const BIT_LSB_FIRST = Self::TX_LSB_FIRST.bits() | Self::RX_LSB_FIRST.bits();
        /// MOSI carries data in both directions
        const THREE_WIRE = 1 << 2;
        /// Chip select is active high
        const POSITIVE_CS = 1 << 3;
        /// Send and receive phases run one after the other
        const HALF_DUPLEX = 1 << 4;
        /// Never add dummy cycles to compensate input delay
        const NO_DUMMY = 1 << 5;
        /// Drop finished transactions after the post-transfer callback
        const NO_RETURN_RESULT = 1 << 6;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for DeviceFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DeviceFlags({=u32:#x})", self.bits());
    }
}

/// Clock feeding the SPI clock divider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockSource {
    /// APB clock
    #[default]
    Apb,
    /// Crystal clock
    Xtal,
}

impl ClockSource {
    /// Source frequency in Hz
    #[must_use]
    pub const fn hz(self) -> u32 {
        match self {
            ClockSource::Apb => APB_CLK_HZ,
            ClockSource::Xtal => XTAL_CLK_HZ,
        }
    }
}

/// Callback run around each transfer, from interrupt or polling context.
pub type TransferCallback = Box<dyn FnMut(&Transaction) + Send>;

/// Configuration for one device on the bus.
pub struct DeviceConfig {
    /// Requested SPI clock in Hz
    pub clock_speed_hz: u32,
    /// Clock source
    pub clock_source: ClockSource,
    /// Pre-division applied to the clock source (at least 1)
    pub source_prescale: u32,
    /// Clock polarity and phase
    pub mode: Mode,
    /// Clock duty cycle in 1/256 (0 means 50 %)
    pub duty_cycle: u16,
    /// Default command phase width
    pub command_bits: u8,
    /// Default address phase width
    pub address_bits: u8,
    /// Default dummy phase width
    pub dummy_bits: u8,
    /// Chip-select setup cycles before the transfer
    pub cs_setup: u8,
    /// Chip-select hold cycles after the transfer
    pub cs_hold: u8,
    /// Slave output delay seen at the sampling point, in ns
    pub input_delay_ns: u32,
    /// Transactions in the air at once (pending + in flight + unretrieved)
    pub queue_size: usize,
    /// Device flags
    pub flags: DeviceFlags,
    /// Runs just before the hardware starts
    pub pre_transfer: Option<TransferCallback>,
    /// Runs once the transfer has finished
    pub post_transfer: Option<TransferCallback>,
}

impl core::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("clock_speed_hz", &self.clock_speed_hz)
            .field("clock_source", &self.clock_source)
            .field("mode", &self.mode)
            .field("queue_size", &self.queue_size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl DeviceConfig {
    /// Mode 0, APB source, default queue depth, no phases
    #[must_use]
    pub fn new(clock_speed_hz: u32) -> Self {
        Self {
            clock_speed_hz,
            clock_source: ClockSource::Apb,
            source_prescale: 1,
            mode: MODE_0,
            duty_cycle: DEFAULT_DUTY_CYCLE,
            command_bits: 0,
            address_bits: 0,
            dummy_bits: 0,
            cs_setup: 0,
            cs_hold: 0,
            input_delay_ns: 0,
            queue_size: DEFAULT_QUEUE_SIZE,
            flags: DeviceFlags::empty(),
            pre_transfer: None,
            post_transfer: None,
        }
    }

    /// Set the SPI mode
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the clock source and its pre-division
    #[must_use]
    pub fn with_clock_source(mut self, source: ClockSource, prescale: u32) -> Self {
        self.clock_source = source;
        self.source_prescale = prescale;
        self
    }

    /// Set the duty cycle (1/256 units)
    #[must_use]
    pub fn with_duty_cycle(mut self, duty: u16) -> Self {
        self.duty_cycle = duty;
        self
    }

    /// Set the default command/address/dummy widths
    #[must_use]
    pub fn with_phase_bits(mut self, command: u8, address: u8, dummy: u8) -> Self {
        self.command_bits = command;
        self.address_bits = address;
        self.dummy_bits = dummy;
        self
    }

    /// Set chip-select setup and hold cycles
    #[must_use]
    pub fn with_cs_timing(mut self, setup: u8, hold: u8) -> Self {
        self.cs_setup = setup;
        self.cs_hold = hold;
        self
    }

    /// Set the input sampling delay
    #[must_use]
    pub fn with_input_delay_ns(mut self, ns: u32) -> Self {
        self.input_delay_ns = ns;
        self
    }

    /// Set the queue depth
    #[must_use]
    pub fn with_queue_size(mut self, depth: usize) -> Self {
        self.queue_size = depth;
        self
    }

    /// Add device flags
    #[must_use]
    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Install the pre-transfer callback
    #[must_use]
    pub fn with_pre_transfer<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Transaction) + Send + 'static,
    {
        self.pre_transfer = Some(Box::new(f));
        self
    }

    /// Install the post-transfer callback
    #[must_use]
    pub fn with_post_transfer<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Transaction) + Send + 'static,
    {
        self.post_transfer = Some(Box::new(f));
        self
    }

    /// Whether the device runs half duplex
    #[inline]
    #[must_use]
    pub fn is_half_duplex(&self) -> bool {
        self.flags.contains(DeviceFlags::HALF_DUPLEX)
    }

    /// Source frequency after pre-division
    #[must_use]
    pub fn source_hz(&self) -> u32 {
        self.clock_source.hz() / self.source_prescale.max(1)
    }

    /// Check the configuration before registration.
    pub(crate) fn validate(&self, bus: &BusConfig) -> Result<()> {
        if self.source_prescale == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.clock_speed_hz == 0 || self.clock_speed_hz > self.source_hz() {
            return Err(Error::InvalidArgument);
        }
        if self.queue_size == 0 || self.duty_cycle > 256 {
            return Err(Error::InvalidArgument);
        }
        if self.command_bits > 16 || self.address_bits > 64 {
            return Err(Error::InvalidArgument);
        }
        if bus.caps.fd_cs_setup_limited
            && !self.is_half_duplex()
            && self.cs_setup > 1
            && (self.command_bits != 0 || self.address_bits != 0)
        {
            return Err(Error::InvalidArgument);
        }
        if self.flags.contains(DeviceFlags::NO_RETURN_RESULT) && self.post_transfer.is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
