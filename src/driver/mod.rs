//! The transaction engine.
//!
//! - [`config`] - bus and device configuration with builder methods
//! - [`clock`] - clock divider search and per-device timing
//! - [`transaction`] - transaction and burst-segment types
//! - `bus` - [`SpiBus`], device registration and the interrupt-queued API
//! - `dispatch` - the interrupt handler body
//! - `polling` - task-context transfers and explicit bus ownership
//! - `burst` - segmented bursts over descriptor chains
//!
//! # Example
//!
//! ```ignore
//! use ph_esp32_spi::driver::{BusConfig, DeviceConfig, SpiBus, Transaction};
//!
//! let bus: SpiBus<_, _, _> = SpiBus::new(BusConfig::new(), hal, lock, memory)?;
//! let dev = bus.register_device(DeviceConfig::new(8_000_000))?;
//! let id = bus.polling_transmit(dev, Transaction::transfer(vec![0x9F], 3), &mut delay)?;
//! ```

// Submodules
mod burst;
mod bus;
pub mod clock;
pub mod config;
pub(crate) mod device;
mod dispatch;
mod polling;
pub mod transaction;

// Re-exports for convenience
pub use bus::SpiBus;
pub use clock::{ClockConfig, DeviceTiming, calc_clock, freq_limit};
pub use config::{BusConfig, ClockSource, DeviceConfig, DeviceFlags, HostCaps, TransferCallback};
pub use device::DeviceHandle;
pub use transaction::{RxData, Segment, TransFlags, Transaction, TxData};
