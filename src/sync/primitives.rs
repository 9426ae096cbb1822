//! State shared between tasks and the bus interrupt handler.

use core::cell::RefCell;

use critical_section::Mutex;

/// A value reachable from both task and interrupt context.
///
/// Each access runs inside a critical section, so closures must stay short
/// and must not block. Nesting access to two different cells is fine;
/// nesting access to the same cell panics.
pub struct CriticalSectionCell<T> {
    inner: Mutex<RefCell<T>>,
}

// SAFETY: every access goes through a critical section, and values only move
// across contexts when `T: Send`.
unsafe impl<T: Send> Sync for CriticalSectionCell<T> {}

impl<T> CriticalSectionCell<T> {
    /// Wrap `value`. Usable in statics.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with the value borrowed mutably.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow(cs).borrow_mut()))
    }

    /// Run `f` with the value borrowed shared.
    #[inline]
    pub fn with_ref<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        critical_section::with(|cs| f(&self.inner.borrow(cs).borrow()))
    }

    /// Unwrap the value; no critical section needed with ownership.
    pub fn into_inner(self) -> T {
        self.inner.into_inner().into_inner()
    }
}

impl<T: Default> Default for CriticalSectionCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn updates_are_visible() {
        let cell = CriticalSectionCell::new(1u32);
        cell.with(|v| *v += 41);
        assert_eq!(cell.with_ref(|v| *v), 42);
        assert_eq!(cell.into_inner(), 42);
    }

    #[test]
    fn default_wraps_default_value() {
        let cell: CriticalSectionCell<(u8, bool)> = CriticalSectionCell::default();
        assert_eq!(cell.into_inner(), (0, false));
    }

    #[test]
    fn distinct_cells_nest() {
        let outer = CriticalSectionCell::new(2u8);
        let inner = CriticalSectionCell::new(3u8);
        let product = outer.with(|a| inner.with_ref(|b| *a * *b));
        assert_eq!(product, 6);
    }

    #[test]
    fn counts_from_many_threads() {
        let cell = CriticalSectionCell::new(0usize);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        cell.with(|v| *v += 1);
                    }
                });
            }
        });
        assert_eq!(cell.into_inner(), 4000);
    }
}
