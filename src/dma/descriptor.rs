//! Linked-list DMA descriptor used by segmented-burst transfers.
//!
//! Each descriptor points at one payload chunk (or one segment configuration
//! buffer) and at the next descriptor in the chain. Ownership bits tell the
//! DMA engine which descriptors it may consume.

/// Descriptor and segment configuration bit field constants.
pub mod bits {
    /// Descriptor word 0: size, length and control bits
    pub mod dw0 {
        /// Buffer size mask (12 bits)
        pub const SIZE_MASK: u32 = 0xFFF;
        /// Buffer size shift
        pub const SIZE_SHIFT: u32 = 0;
        /// Valid data length mask (12 bits)
        pub const LENGTH_MASK: u32 = 0xFFF << 12;
        /// Valid data length shift
        pub const LENGTH_SHIFT: u32 = 12;
        /// Last descriptor of the chain
        pub const SUC_EOF: u32 = 1 << 30;
        /// Descriptor owned by DMA when set, by CPU when clear
        pub const OWNER_DMA: u32 = 1 << 31;
    }

    /// Segment configuration buffer word layout.
    ///
    /// The HAL's segment loader copies these words into the controller's
    /// user-command registers before each segment runs.
    pub mod conf {
        /// Number of 32-bit words in one configuration buffer
        pub const WORDS: usize = 8;

        /// Word index: bitmap of registers this buffer updates
        pub const BITMAP: usize = 0;
        /// Word index: command value
        pub const COMMAND: usize = 1;
        /// Word index: address low 32 bits
        pub const ADDRESS_LO: usize = 2;
        /// Word index: address high 32 bits
        pub const ADDRESS_HI: usize = 3;
        /// Word index: phase bit counts (see `PHASE_*` shifts)
        pub const PHASES: usize = 4;
        /// Word index: data bit counts (tx in low half, rx in high half)
        pub const DATA_BITS: usize = 5;
        /// Word index: chip-select timing and segment gap
        pub const TIMING: usize = 6;
        /// Word index: control bits (see `CTRL_*`)
        pub const CTRL: usize = 7;

        /// Bitmap value marking every user register as updated
        pub const BITMAP_ALL: u32 = 0x7F;

        /// Command bit count shift in `PHASES`
        pub const PHASE_CMD_SHIFT: u32 = 0;
        /// Address bit count shift in `PHASES`
        pub const PHASE_ADDR_SHIFT: u32 = 8;
        /// Dummy bit count shift in `PHASES`
        pub const PHASE_DUMMY_SHIFT: u32 = 16;
        /// Data line count shift in `PHASES`
        pub const PHASE_LINES_SHIFT: u32 = 24;

        /// Chip-select setup shift in `TIMING`
        pub const TIMING_SETUP_SHIFT: u32 = 0;
        /// Chip-select hold shift in `TIMING`
        pub const TIMING_HOLD_SHIFT: u32 = 8;
        /// Inter-segment gap shift in `TIMING`
        pub const TIMING_GAP_SHIFT: u32 = 16;

        /// Segment sends data
        pub const CTRL_MOSI: u32 = 1 << 0;
        /// Segment receives data
        pub const CTRL_MISO: u32 = 1 << 1;
        /// Chip select stays asserted after the segment
        pub const CTRL_CS_KEEP: u32 = 1 << 2;
        /// Last segment of the burst
        pub const CTRL_EOF: u32 = 1 << 31;
    }
}

use bits::dw0;

/// Volatile cell wrapper for descriptor fields
///
/// Ensures all accesses are volatile so the compiler neither caches nor
/// reorders descriptor reads and writes the DMA engine observes.
#[repr(transparent)]
pub(crate) struct VolatileCell<T: Copy> {
    value: core::cell::UnsafeCell<T>,
}

// Safety: all access is through volatile operations, which are single
// word-sized loads and stores for u32 on ESP32.
unsafe impl<T: Copy> Sync for VolatileCell<T> {}

impl<T: Copy> VolatileCell<T> {
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self {
            value: core::cell::UnsafeCell::new(value),
        }
    }

    #[inline(always)]
    pub fn get(&self) -> T {
        // SAFETY: the pointer comes from our own UnsafeCell and is always valid.
        unsafe { core::ptr::read_volatile(self.value.get()) }
    }

    #[inline(always)]
    pub fn set(&self, value: T) {
        // SAFETY: the pointer comes from our own UnsafeCell and is always valid.
        unsafe { core::ptr::write_volatile(self.value.get(), value) }
    }

    #[inline(always)]
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(T) -> T,
    {
        let old = self.get();
        self.set(f(old));
    }
}

/// Hardware linked-list descriptor (12 bytes, word aligned).
#[repr(C)]
#[cfg_attr(not(feature = "esp32p4"), repr(align(4)))]
#[cfg_attr(feature = "esp32p4", repr(align(64)))]
pub struct DmaDescriptor {
    dw0: VolatileCell<u32>,
    buffer: VolatileCell<u32>,
    next: VolatileCell<u32>,
}

impl DmaDescriptor {
    /// Create a new zeroed, CPU-owned descriptor.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dw0: VolatileCell::new(0),
            buffer: VolatileCell::new(0),
            next: VolatileCell::new(0),
        }
    }

    /// Point the descriptor at a buffer and hand it to the DMA engine.
    ///
    /// `size` is the buffer capacity, `length` the number of valid bytes
    /// (zero for receive descriptors, the hardware fills it in).
    pub(crate) fn prepare(&self, buffer: *const u8, size: usize, length: usize, eof: bool) {
        self.buffer.set(buffer as usize as u32);
        let mut word = ((size as u32) << dw0::SIZE_SHIFT) & dw0::SIZE_MASK;
        word |= ((length as u32) << dw0::LENGTH_SHIFT) & dw0::LENGTH_MASK;
        if eof {
            word |= dw0::SUC_EOF;
        }
        self.dw0.set(word | dw0::OWNER_DMA);
    }

    /// Link to the next descriptor, or terminate the chain with `None`.
    pub(crate) fn link(&self, next: Option<&DmaDescriptor>) {
        let addr = next.map_or(0, |d| d as *const DmaDescriptor as usize as u32);
        self.next.set(addr);
    }

    /// Return the descriptor to the CPU and clear its chain pointers.
    pub(crate) fn reset(&self) {
        self.dw0.set(0);
        self.buffer.set(0);
        self.next.set(0);
    }

    /// Hand ownership back to the CPU without touching the payload fields.
    #[inline(always)]
    pub(crate) fn release(&self) {
        self.dw0.update(|v| v & !dw0::OWNER_DMA);
    }

    /// Check if descriptor is owned by DMA.
    #[inline(always)]
    #[must_use]
    pub fn is_owned(&self) -> bool {
        (self.dw0.get() & dw0::OWNER_DMA) != 0
    }

    /// Check if this is the last descriptor of its chain.
    #[inline(always)]
    #[must_use]
    pub fn is_eof(&self) -> bool {
        (self.dw0.get() & dw0::SUC_EOF) != 0
    }

    /// Buffer capacity in bytes.
    #[inline(always)]
    #[must_use]
    pub fn size(&self) -> usize {
        ((self.dw0.get() & dw0::SIZE_MASK) >> dw0::SIZE_SHIFT) as usize
    }

    /// Valid data length in bytes.
    #[inline(always)]
    #[must_use]
    pub fn length(&self) -> usize {
        ((self.dw0.get() & dw0::LENGTH_MASK) >> dw0::LENGTH_SHIFT) as usize
    }

    /// Buffer address as seen by the DMA engine.
    #[inline(always)]
    #[must_use]
    pub fn buffer_addr(&self) -> u32 {
        self.buffer.get()
    }

    /// Next descriptor address (0 terminates the chain).
    #[inline(always)]
    #[must_use]
    pub fn next_addr(&self) -> u32 {
        self.next.get()
    }
}

impl Default for DmaDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_descriptor_is_cpu_owned() {
        let d = DmaDescriptor::new();
        assert!(!d.is_owned());
        assert!(!d.is_eof());
        assert_eq!(d.next_addr(), 0);
    }

    #[test]
    fn prepare_sets_fields_and_ownership() {
        let buf = [0u8; 16];
        let d = DmaDescriptor::new();
        d.prepare(buf.as_ptr(), 16, 10, true);

        assert!(d.is_owned());
        assert!(d.is_eof());
        assert_eq!(d.size(), 16);
        assert_eq!(d.length(), 10);
        assert_eq!(d.buffer_addr(), buf.as_ptr() as usize as u32);
    }

    #[test]
    fn max_payload_fits_size_field() {
        let d = DmaDescriptor::new();
        d.prepare(core::ptr::null(), crate::constants::DMA_DESC_MAX_PAYLOAD, 0, false);
        assert_eq!(d.size(), crate::constants::DMA_DESC_MAX_PAYLOAD);
    }

    #[test]
    fn link_and_reset() {
        let a = DmaDescriptor::new();
        let b = DmaDescriptor::new();
        a.link(Some(&b));
        assert_eq!(a.next_addr(), &b as *const DmaDescriptor as usize as u32);

        a.link(None);
        assert_eq!(a.next_addr(), 0);

        a.prepare(core::ptr::null(), 4, 4, false);
        a.release();
        assert!(!a.is_owned());
        assert_eq!(a.length(), 4);

        a.reset();
        assert_eq!(a.size(), 0);
        assert_eq!(a.buffer_addr(), 0);
    }
}
