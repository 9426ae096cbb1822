//! ESP32 SPI Master Transaction Engine
//!
//! A `no_std` engine that shares one SPI host among several devices, each on
//! its own chip-select line, from two execution contexts: application tasks
//! that queue work or run blocking polling transfers, and the bus interrupt
//! handler that dispatches queued work as transfers complete.
//!
//! # Architecture
//!
//! 1. **Driver** ([`driver`]): [`SpiBus`] with device registration, the
//!    interrupt-queued API, the dispatcher, polling mode and segmented bursts
//! 2. **DMA** ([`dma`]): buffer preparation and the burst descriptor pools
//! 3. **Collaborators** ([`hal`], [`lock`]): the register-level controller,
//!    the memory map and bus-ownership arbitration, all behind traits
//!
//! Exactly one device drives the bus at a time. Per device, results come
//! back in submission order.
//!
//! # Features
//!
//! - `esp32` (default): Original ESP32 host capabilities
//! - `esp32p4`: ESP32-P4 host capabilities (octal, segmented bursts)
//! - `defmt`: Enable defmt formatting and log output
//! - `log`: Enable `log` facade output
//!
//! # Example
//!
//! ```ignore
//! use ph_esp32_spi::{BusConfig, DeviceConfig, InternalMemory, SimpleBusLock, SpiBus};
//! use ph_esp32_spi::{Timeout, Transaction};
//!
//! // `hal` implements SpiHal for the chosen host
//! let bus: SpiBus<_, _, _> = SpiBus::new(
//!     BusConfig::new(),
//!     hal,
//!     SimpleBusLock::new(),
//!     InternalMemory,
//! )?;
//!
//! let flash = bus.register_device(DeviceConfig::new(20_000_000).with_queue_size(4))?;
//!
//! // Queued: returns once the transaction is in the device queue
//! bus.submit(flash, Transaction::transfer(vec![0x9F], 3), Timeout::Forever, &mut delay)?;
//! let id = bus.retrieve(flash, Timeout::Forever, &mut delay)?;
//!
//! // Polling: runs on the caller's task, bypassing the queue
//! let status = bus.polling_transmit(flash, Transaction::transfer(vec![0x05], 1), &mut delay)?;
//!
//! // From the SPI host interrupt:
//! bus.on_interrupt();
//! ```
//!
//! # Memory Requirements
//!
//! Each device queue, temporary DMA buffer and burst configuration buffer is
//! heap allocated, so a global allocator is required. Each bus also boxes
//! two descriptor pools of `RING` 12-byte descriptors for segmented bursts.

#![cfg_attr(docsrs, doc(cfg_hide(feature = "esp32p4")))]
#![no_std]
#![deny(missing_docs)]
#![allow(unsafe_code)]
#![deny(unsafe_op_in_unsafe_fn)]
// Clippy lint levels live here; thresholds and config are in Cargo.toml.
#![deny(clippy::correctness)]
#![warn(
    clippy::suspicious,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::cloned_instead_of_copied,
    clippy::explicit_iter_loop,
    clippy::implicit_clone,
    clippy::inconsistent_struct_constructor,
    clippy::manual_assert,
    clippy::manual_let_else,
    clippy::match_same_arms,
    clippy::needless_pass_by_value,
    clippy::semicolon_if_nothing_returned,
    clippy::uninlined_format_args,
    clippy::unnested_or_patterns,
    clippy::std_instead_of_core,
    clippy::std_instead_of_alloc,
    clippy::alloc_instead_of_core
)]
#![allow(
    clippy::mod_module_files,
    clippy::self_named_module_files,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::struct_excessive_bools,
    clippy::fn_params_excessive_bools,
    clippy::type_complexity,
    clippy::must_use_candidate,
    clippy::assertions_on_constants,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_lossless,
    clippy::panic_in_result_fn,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::items_after_statements
)]
#[cfg(all(feature = "esp32", feature = "esp32p4"))]
compile_error!("Features 'esp32' and 'esp32p4' are mutually exclusive.");

#[cfg(not(any(feature = "esp32", feature = "esp32p4")))]
compile_error!("Either feature 'esp32' or 'esp32p4' must be enabled. The default is 'esp32'.");

extern crate alloc;

// =============================================================================
// Modules
// =============================================================================

pub mod constants;
pub mod dma;
pub mod driver;
pub mod error;
pub mod hal;
pub mod lock;
pub mod sync;

// Test utilities (only available during testing)
#[cfg(test)]
pub mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use driver::{
    BusConfig, ClockSource, DeviceConfig, DeviceFlags, DeviceHandle, HostCaps, RxData, Segment,
    SpiBus, TransFlags, Transaction, TransferCallback, TxData,
};
pub use error::{Error, Rejected, Result};
pub use hal::{DmaMemory, FifoStatus, HwTransaction, InternalMemory, LineMode, SpiHal};
pub use lock::{BgExit, BgSelect, BusLock, SimpleBusLock};
pub use sync::{CriticalSectionCell, Timeout};
