//! Bounded FIFO used for the per-device pending and completed queues.
//!
//! The queue itself is not synchronized; it lives inside the device slot's
//! [`CriticalSectionCell`](super::CriticalSectionCell), which serializes
//! producers and the consumer.

use alloc::collections::VecDeque;

use crate::error::{Error, Result};

/// Fixed-capacity FIFO with a runtime depth.
#[derive(Debug)]
pub(crate) struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Allocate a queue holding at most `capacity` items.
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self> {
        let mut items = VecDeque::new();
        items.try_reserve_exact(capacity).map_err(|_| Error::NoMemory)?;
        Ok(Self { items, capacity })
    }

    /// Append an item, handing it back when the queue is full.
    pub(crate) fn push(&mut self, item: T) -> core::result::Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Remove the oldest item.
    pub(crate) fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Oldest item without removing it.
    pub(crate) fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = BoundedQueue::with_capacity(3).unwrap();
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_when_full_returns_item() {
        let mut q = BoundedQueue::with_capacity(1).unwrap();
        q.push(10).unwrap();
        assert!(q.is_full());
        assert_eq!(q.push(11), Err(11));
        assert_eq!(q.front(), Some(&10));
        assert_eq!(q.pop(), Some(10));
        assert!(q.is_empty());
    }

    #[test]
    fn zero_depth_refuses_everything() {
        let mut q = BoundedQueue::with_capacity(0).unwrap();
        assert!(q.is_empty());
        assert_eq!(q.push('a'), Err('a'));
    }
}
