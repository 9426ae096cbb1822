//! Memory-region queries and cache maintenance for DMA buffers.

use crate::constants::DMA_INTERNAL_ALIGN;

/// Where a buffer lives and what DMA needs from it.
///
/// Methods take `&self`: the engine calls them from both task and interrupt
/// context.
pub trait DmaMemory {
    /// Whether the DMA engine can reach `len` bytes at `addr`.
    fn is_dma_capable(&self, addr: usize, len: usize) -> bool;

    /// Required address (and, when cached, length) alignment at `addr`.
    fn alignment(&self, addr: usize) -> usize;

    /// Whether `addr` is in external memory (PSRAM).
    fn is_external(&self, _addr: usize) -> bool {
        false
    }

    /// Whether `addr` is behind a data cache.
    fn is_cached(&self, _addr: usize) -> bool {
        false
    }

    /// Write dirty cache lines back to memory before DMA reads them.
    fn writeback(&self, _addr: usize, _len: usize) {}

    /// Drop cache lines so the CPU sees what DMA wrote.
    fn invalidate(&self, _addr: usize, _len: usize) {}
}

/// Internal SRAM only: everything DMA-capable, word aligned, uncached.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalMemory;

impl DmaMemory for InternalMemory {
    fn is_dma_capable(&self, _addr: usize, _len: usize) -> bool {
        true
    }

    fn alignment(&self, _addr: usize) -> usize {
        DMA_INTERNAL_ALIGN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_memory_is_plain() {
        let m = InternalMemory;
        assert!(m.is_dma_capable(0x3FFB_0000, 100));
        assert_eq!(m.alignment(0x3FFB_0000), DMA_INTERNAL_ALIGN);
        assert!(!m.is_external(0x3FFB_0000));
        assert!(!m.is_cached(0x3FFB_0000));
    }
}
