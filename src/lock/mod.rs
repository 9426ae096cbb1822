//! Bus-ownership lock contract.
//!
//! The engine does not decide which device runs next. It asks a [`BusLock`],
//! which owns the chip-select slot allocator, exclusive acquisition and the
//! per-device background-request flags. [`SimpleBusLock`] is a round-robin
//! implementation built on a critical-section cell.
//!
//! Methods returning `bool` for "arm" tell the caller to unmask the bus
//! interrupt so the dispatcher runs. The engine performs the lock call and
//! the interrupt change inside one critical section.

mod simple;

use embedded_hal::delay::DelayNs;

use crate::driver::device::DeviceHandle;
use crate::error::Result;
use crate::sync::Timeout;

pub use simple::SimpleBusLock;

/// Outcome of the dispatcher's device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BgSelect {
    /// Serve this device's pending queue
    Device(DeviceHandle),
    /// Acquisition was handed to a waiting task; stop dispatching
    Resume,
    /// Nothing runnable
    Idle,
}

/// Dispatcher loop decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BgExit {
    /// New work raced in; run the selection again
    Continue,
    /// Leave the handler
    Yield,
}

/// Arbitration between devices sharing one bus.
///
/// All methods are called with a shared reference from task and interrupt
/// context and must not block, except [`acquire_start`](Self::acquire_start),
/// which only runs in task context.
pub trait BusLock {
    /// Allocate a free chip-select slot.
    fn register_device(&self) -> Option<DeviceHandle>;

    /// Release a slot allocated by [`register_device`](Self::register_device).
    fn unregister_device(&self, dev: DeviceHandle);

    /// Take exclusive ownership of the bus for `dev`.
    ///
    /// Returns once the dispatcher is idle and `dev` holds the bus, or
    /// `Timeout` when `timeout` runs out first.
    fn acquire_start<D: DelayNs>(&self, dev: DeviceHandle, timeout: Timeout, delay: &mut D) -> Result<()>;

    /// Give up ownership taken by [`acquire_start`](Self::acquire_start).
    ///
    /// Returns `true` when the caller should arm the interrupt.
    fn acquire_end(&self, dev: DeviceHandle) -> bool;

    /// Device currently holding exclusive ownership.
    fn acquiring_device(&self) -> Option<DeviceHandle>;

    /// Mark `dev` as having queued interrupt-mode work.
    ///
    /// Returns `true` when the caller should arm the interrupt.
    fn bg_request(&self, dev: DeviceHandle) -> bool;

    /// Called on interrupt entry. Returns `true` when a transfer was in flight.
    fn bg_entry(&self) -> bool;

    /// Pick the next device when nobody holds exclusive ownership.
    ///
    /// May hand ownership to a task blocked in
    /// [`acquire_start`](Self::acquire_start).
    fn bg_check_dev_acq(&self) -> BgSelect;

    /// Whether `dev` has a background request pending.
    fn bg_check_dev_req(&self, dev: DeviceHandle) -> bool;

    /// Clear the background request of `dev` (its queue is empty).
    fn bg_clear_req(&self, dev: DeviceHandle);

    /// Called before leaving the handler.
    fn bg_exit(&self, dispatched: bool) -> BgExit;

    /// Note that `dev` is about to drive the bus.
    ///
    /// Returns `true` when another device was programmed since `dev` last
    /// ran, so its timing has to be reloaded.
    fn touch(&self, dev: DeviceHandle) -> bool;
}
