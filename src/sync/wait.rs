//! Bounded task-side waits.
//!
//! Tasks wait by polling a condition and sleeping on the caller's
//! `DelayNs` between checks. Elapsed time is accumulated from the requested
//! delays, so a wait never outlives its [`Timeout`] budget by more than one
//! interval.

use embedded_hal::delay::DelayNs;

use crate::constants::TICK_PERIOD_US;

/// How long a task-side operation may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Check once and return immediately
    NoWait,
    /// Wait up to this many scheduler ticks
    Ticks(u32),
    /// Wait until the condition holds
    #[default]
    Forever,
}

impl Timeout {
    /// Wait budget in microseconds, `None` when unbounded.
    #[must_use]
    pub const fn as_us(self) -> Option<u64> {
        match self {
            Timeout::NoWait => Some(0),
            Timeout::Ticks(n) => Some(n as u64 * TICK_PERIOD_US as u64),
            Timeout::Forever => None,
        }
    }

    /// Timeout of at least `ms` milliseconds
    #[must_use]
    pub const fn from_ms(ms: u32) -> Self {
        Timeout::Ticks((ms as u64 * 1000).div_ceil(TICK_PERIOD_US as u64) as u32)
    }
}

/// Poll `check` until it yields a value or the budget runs out.
///
/// `check` runs at least once, even for [`Timeout::NoWait`].
pub(crate) fn wait_for<T, D, F>(timeout: Timeout, interval_us: u32, delay: &mut D, mut check: F) -> Option<T>
where
    D: DelayNs,
    F: FnMut() -> Option<T>,
{
    let budget = timeout.as_us();
    let mut elapsed = 0u64;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if budget.is_some_and(|b| elapsed >= b) {
            return None;
        }
        delay.delay_us(interval_us);
        elapsed += interval_us as u64;
    }
}
