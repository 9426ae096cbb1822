//! DMA buffer preparation.
//!
//! A caller buffer goes to the DMA engine as-is when the memory layer says it
//! is reachable and suitably aligned. Otherwise it is staged through an
//! aligned temporary: copied in before a send, copied back to the caller
//! after a receive. Cache lines are written back before the hardware reads a
//! buffer and invalidated after it writes one.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::constants::DMA_INTERNAL_ALIGN;
use crate::driver::transaction::{RxData, TransFlags, Transaction, TxData};
use crate::error::{Error, Result};
use crate::hal::DmaMemory;

// =============================================================================
// Temporary buffer
// =============================================================================

/// Aligned heap buffer owned by the engine for the life of one transfer.
pub(crate) struct DmaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned; the raw pointer is never shared
// outside the transfer that owns it.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `len` zeroed bytes rounded up to `align`.
    pub(crate) fn alloc(len: usize, align: usize) -> Result<Self> {
        let align = align.max(1);
        let size = len.max(1).next_multiple_of(align);
        let layout = Layout::from_size_align(size, align).map_err(|_| Error::InvalidArgument)?;
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::NoMemory)?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Allocated size (a multiple of the alignment)
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() bytes and uniquely borrowed
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `alloc` with this layout
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// =============================================================================
// Staging
// =============================================================================

/// How one direction of a transfer reaches the hardware.
pub(crate) enum Stage {
    /// Direction unused
    None,
    /// CPU copies through the controller FIFO
    Fifo,
    /// DMA works on the caller's buffer
    Direct {
        /// Buffer is in external memory
        external: bool,
    },
    /// DMA works on an engine-owned copy
    Bounce(DmaBuffer),
}

impl Stage {
    #[inline]
    pub(crate) fn is_dma(&self) -> bool {
        matches!(self, Stage::Direct { .. } | Stage::Bounce(_))
    }

    #[inline]
    pub(crate) fn is_external(&self) -> bool {
        matches!(self, Stage::Direct { external: true })
    }
}

enum Placement {
    Direct { external: bool },
    Bounce { align: usize },
}

fn place<M: DmaMemory>(addr: usize, len: usize, flags: TransFlags, memory: &M) -> Result<Placement> {
    let external = memory.is_external(addr);
    let reachable = if external {
        flags.contains(TransFlags::DMA_USE_PSRAM)
    } else {
        memory.is_dma_capable(addr, len)
    };
    let align = memory.alignment(addr).max(DMA_INTERNAL_ALIGN);
    let aligned = (addr | len) & (align - 1) == 0;

    if reachable && aligned {
        return Ok(Placement::Direct { external });
    }
    if flags.contains(TransFlags::DMA_BUFFER_ALIGN_MANUAL) {
        return Err(Error::InvalidArgument);
    }
    Ok(Placement::Bounce { align })
}

/// Whether DMA can work on `data` in place, without a temporary copy.
pub(crate) fn dma_ready<M: DmaMemory>(data: &[u8], flags: TransFlags, memory: &M) -> bool {
    let flags = flags | TransFlags::DMA_BUFFER_ALIGN_MANUAL;
    matches!(
        place(data.as_ptr() as usize, data.len(), flags, memory),
        Ok(Placement::Direct { .. })
    )
}

/// Resolved buffers for both directions of a transfer.
pub(crate) struct PreparedBuffers {
    pub tx: Stage,
    pub rx: Stage,
}

impl PreparedBuffers {
    /// Buffers for a transfer with no data phases
    pub(crate) const NONE: PreparedBuffers = PreparedBuffers {
        tx: Stage::None,
        rx: Stage::None,
    };

    /// Resolve both directions of a validated transaction.
    pub(crate) fn prepare<M: DmaMemory>(trans: &Transaction, dma: bool, memory: &M) -> Result<Self> {
        let tx = match &trans.tx {
            TxData::None => Stage::None,
            TxData::Inline(_) => Stage::Fifo,
            TxData::Buffer(_) if !dma => Stage::Fifo,
            TxData::Buffer(_) => {
                let data = trans.tx_data();
                let addr = data.as_ptr() as usize;
                match place(addr, data.len(), trans.flags, memory)? {
                    Placement::Direct { external } => {
                        if memory.is_cached(addr) {
                            memory.writeback(addr, data.len());
                        }
                        Stage::Direct { external }
                    }
                    Placement::Bounce { align } => {
                        let mut buf = DmaBuffer::alloc(data.len(), align)?;
                        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
                        if memory.is_cached(buf.addr()) {
                            memory.writeback(buf.addr(), buf.capacity());
                        }
                        Stage::Bounce(buf)
                    }
                }
            }
        };

        let rx = match &trans.rx {
            RxData::None => Stage::None,
            RxData::Inline(_) => Stage::Fifo,
            RxData::Buffer(_) if !dma => Stage::Fifo,
            RxData::Buffer(_) => {
                let data = trans.rx_data();
                let addr = data.as_ptr() as usize;
                match place(addr, data.len(), trans.flags, memory)? {
                    Placement::Direct { external } => Stage::Direct { external },
                    Placement::Bounce { align } => Stage::Bounce(DmaBuffer::alloc(data.len(), align)?),
                }
            }
        };

        Ok(Self { tx, rx })
    }

    /// Transmit DMA source, or `None` when the FIFO or nothing is used.
    pub(crate) fn tx_dma(&self, trans: &Transaction) -> Option<(*const u8, usize)> {
        match &self.tx {
            Stage::Direct { .. } => Some((trans.tx_data().as_ptr(), trans.tx_bytes())),
            Stage::Bounce(buf) => Some((buf.as_ptr(), trans.tx_bytes())),
            Stage::None | Stage::Fifo => None,
        }
    }

    /// Receive DMA destination, or `None` when the FIFO or nothing is used.
    pub(crate) fn rx_dma(&mut self, trans: &mut Transaction) -> Option<(*mut u8, usize)> {
        let len = trans.rx_bytes();
        match &mut self.rx {
            Stage::Direct { .. } => Some((trans.rx_data_mut().as_mut_ptr(), len)),
            Stage::Bounce(buf) => Some((buf.as_mut_ptr(), len)),
            Stage::None | Stage::Fifo => None,
        }
    }

    /// Make received data visible to the CPU once the hardware is done.
    pub(crate) fn sync_after_receive<M: DmaMemory>(&self, trans: &Transaction, memory: &M) {
        let (addr, len) = match &self.rx {
            Stage::Direct { .. } => {
                let data = trans.rx_data();
                (data.as_ptr() as usize, data.len())
            }
            Stage::Bounce(buf) => (buf.addr(), buf.capacity()),
            Stage::None | Stage::Fifo => return,
        };
        if memory.is_cached(addr) {
            memory.invalidate(addr, len);
        }
    }

    /// Hand the data back to the caller and free any temporaries.
    pub(crate) fn finalize(self, trans: &mut Transaction) {
        if let Stage::Bounce(buf) = self.rx {
            let dst = trans.rx_data_mut();
            let len = dst.len();
            dst.copy_from_slice(&buf.as_slice()[..len]);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
