//! Circular descriptor pool shared by every segmented burst on a bus.
//!
//! Slots are claimed as contiguous runs (wrapping at the array end) when a
//! burst is queued and returned only once the hardware has consumed them.
//! Bursts complete in the order they were queued, so runs are always
//! recycled from the tail in claim order.

use super::descriptor::DmaDescriptor;

/// A contiguous (wrapping) run of claimed slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotRun {
    /// First slot index
    pub head: usize,
    /// Number of slots
    pub count: usize,
}

impl SlotRun {
    pub(crate) const EMPTY: SlotRun = SlotRun { head: 0, count: 0 };
}

/// Head of a linked descriptor chain handed to the DMA engine.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorChain {
    /// First descriptor of the chain
    pub head: *const DmaDescriptor,
    /// Number of linked descriptors
    pub len: usize,
}

/// Circular descriptor pool with free-count accounting.
pub struct DescriptorPool<const N: usize> {
    /// Array of descriptors
    descriptors: [DmaDescriptor; N],
    /// Next slot to claim
    head: usize,
    /// Oldest slot still owned by an unfinished burst
    tail: usize,
    /// Slots available for claiming
    free: usize,
}

impl<const N: usize> DescriptorPool<N> {
    /// Create a pool with every slot free. Const-compatible.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            descriptors: [const { DmaDescriptor::new() }; N],
            head: 0,
            tail: 0,
            free: N,
        }
    }

    /// Total number of slots
    #[inline(always)]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Slots available for claiming
    #[inline(always)]
    #[must_use]
    pub const fn free(&self) -> usize {
        self.free
    }

    /// Slots held by bursts that have not completed yet
    #[inline(always)]
    #[must_use]
    pub const fn in_use(&self) -> usize {
        N - self.free
    }

    /// Return every slot to the pool and rewind both cursors.
    ///
    /// Only valid when no burst is queued or in flight.
    pub(crate) fn reset(&mut self) {
        for desc in &self.descriptors {
            desc.reset();
        }
        self.head = 0;
        self.tail = 0;
        self.free = N;
    }

    /// Claim `count` contiguous slots, or `None` without side effects.
    pub(crate) fn claim(&mut self, count: usize) -> Option<SlotRun> {
        if count > self.free {
            return None;
        }
        if count == 0 {
            return Some(SlotRun::EMPTY);
        }
        let run = SlotRun {
            head: self.head,
            count,
        };
        self.head = (self.head + count) % N;
        self.free -= count;
        Some(run)
    }

    /// Return a run the hardware has finished with.
    pub(crate) fn recycle(&mut self, run: SlotRun) {
        if run.count == 0 {
            return;
        }
        debug_assert_eq!(run.head, self.tail, "descriptor runs recycled out of order");
        for i in 0..run.count {
            self.slot(run, i).release();
        }
        self.tail = (self.tail + run.count) % N;
        self.free += run.count;
        debug_assert!(self.free <= N);
    }

    /// Descriptor at position `i` of a run.
    #[inline(always)]
    pub(crate) fn slot(&self, run: SlotRun, i: usize) -> &DmaDescriptor {
        &self.descriptors[(run.head + i) % N]
    }

    /// Link the run's descriptors in order and terminate the chain.
    pub(crate) fn link(&self, run: SlotRun) {
        for i in 0..run.count {
            let next = (i + 1 < run.count).then(|| self.slot(run, i + 1));
            self.slot(run, i).link(next);
        }
    }

    /// Chain head for the hardware, `None` for an empty run.
    pub(crate) fn chain(&self, run: SlotRun) -> Option<DescriptorChain> {
        (run.count > 0).then(|| DescriptorChain {
            head: self.slot(run, 0) as *const DmaDescriptor,
            len: run.count,
        })
    }
}

impl<const N: usize> Default for DescriptorPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
