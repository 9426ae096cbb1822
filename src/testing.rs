//! Testing utilities and mock implementations
//!
//! Host-side stand-ins for the controller, the memory map and the delay
//! provider, so the dispatcher, lock and polling paths run under
//! `cargo test` without hardware.

// Note: The #[cfg(test)] attribute is applied in lib.rs where this module is declared
#![allow(missing_docs)]
#![allow(clippy::std_instead_of_core, clippy::std_instead_of_alloc)]

extern crate std;

use core::ops::Range;
use std::boxed::Box;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use embedded_hal::delay::DelayNs;

use crate::driver::{BusConfig, DeviceConfig, DeviceTiming, SpiBus};
use crate::hal::{DescriptorChain, DmaMemory, FifoStatus, HwTransaction, SpiHal};
use crate::lock::SimpleBusLock;

// =============================================================================
// Mock SPI host
// =============================================================================

/// One call made on [`MockHal`]. Interrupt masking is tracked as state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalCall {
    SetupDevice(DeviceTiming),
    SetupTransaction(HwTransaction),
    ResetDma,
    LoadTx(usize),
    LoadRx(usize),
    WriteFifo(Vec<u8>),
    ReadFifo(usize),
    Start,
    EnableBurst(bool),
    StartBurst { tx: usize, rx: Option<usize> },
}

#[derive(Debug)]
struct HalState {
    calls: Vec<HalCall>,
    irq_enabled: bool,
    done: bool,
    auto_complete: bool,
    rx_pattern: Vec<u8>,
    fifo_status: FifoStatus,
    /// Receive DMA target of the transfer in progress
    rx_dma: Option<(usize, usize)>,
    starts: usize,
}

/// Mock SPI controller.
///
/// Clones share state: the bus owns one, the test keeps another to drive
/// completion and inspect what was programmed. Done starts set and, with
/// auto-complete on (the default), every start finishes at once.
#[derive(Debug, Clone)]
pub struct MockHal {
    state: Arc<Mutex<HalState>>,
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HalState {
                calls: Vec::new(),
                irq_enabled: false,
                done: true,
                auto_complete: true,
                rx_pattern: std::vec![0],
                fifo_status: FifoStatus::default(),
                rx_dma: None,
                starts: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, HalState> {
        self.state.lock().unwrap()
    }

    /// Everything programmed so far, in order
    pub fn calls(&self) -> Vec<HalCall> {
        self.state().calls.clone()
    }

    pub fn irq_enabled(&self) -> bool {
        self.state().irq_enabled
    }

    pub fn set_irq_enabled(&self, enabled: bool) {
        self.state().irq_enabled = enabled;
    }

    pub fn set_auto_complete(&self, auto: bool) {
        self.state().auto_complete = auto;
    }

    /// Bytes the "device" sends back, repeated to fill any receive area
    pub fn set_rx_pattern(&self, pattern: &[u8]) {
        self.state().rx_pattern = pattern.to_vec();
    }

    pub fn set_fifo_status(&self, status: FifoStatus) {
        self.state().fifo_status = status;
    }

    /// Number of plain and burst starts
    pub fn starts(&self) -> usize {
        self.state().starts
    }

    /// Finish the transfer in progress: fill the receive DMA area and raise
    /// the done flag.
    pub fn complete(&self) {
        Self::finish(&mut self.state());
    }

    /// Data written to the FIFO, one entry per transfer
    pub fn fifo_writes(&self) -> Vec<Vec<u8>> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                HalCall::WriteFifo(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of DMA channel loads
    pub fn dma_loads(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, HalCall::LoadTx(_) | HalCall::LoadRx(_)))
            .count()
    }

    /// Chain lengths of every burst started
    pub fn bursts(&self) -> Vec<(usize, Option<usize>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match *c {
                HalCall::StartBurst { tx, rx } => Some((tx, rx)),
                _ => None,
            })
            .collect()
    }

    fn finish(state: &mut HalState) {
        if let Some((addr, len)) = state.rx_dma.take() {
            // SAFETY: the address came from `load_rx_dma`, whose caller keeps
            // `len` bytes valid until the transfer is done
            let target = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) };
            for (byte, value) in target.iter_mut().zip(state.rx_pattern.iter().cycle()) {
                *byte = *value;
            }
        }
        state.done = true;
    }

    fn begin(state: &mut HalState) {
        state.done = false;
        state.starts += 1;
        if state.auto_complete {
            Self::finish(state);
        }
    }
}

impl SpiHal for MockHal {
    fn setup_device(&mut self, timing: &DeviceTiming) {
        self.state().calls.push(HalCall::SetupDevice(*timing));
    }

    fn setup_transaction(&mut self, trans: &HwTransaction) {
        self.state().calls.push(HalCall::SetupTransaction(*trans));
    }

    fn reset_dma(&mut self) {
        self.state().calls.push(HalCall::ResetDma);
    }

    unsafe fn load_tx_dma(&mut self, _buf: *const u8, len: usize) {
        self.state().calls.push(HalCall::LoadTx(len));
    }

    unsafe fn load_rx_dma(&mut self, buf: *mut u8, len: usize) {
        let mut state = self.state();
        state.calls.push(HalCall::LoadRx(len));
        state.rx_dma = Some((buf as usize, len));
    }

    fn write_fifo(&mut self, data: &[u8]) {
        self.state().calls.push(HalCall::WriteFifo(data.to_vec()));
    }

    fn read_fifo(&mut self, data: &mut [u8]) {
        let mut state = self.state();
        state.calls.push(HalCall::ReadFifo(data.len()));
        let pattern = &state.rx_pattern;
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = pattern[i % pattern.len()];
        }
    }

    fn start(&mut self) {
        let mut state = self.state();
        state.calls.push(HalCall::Start);
        Self::begin(&mut state);
    }

    fn is_done(&self) -> bool {
        self.state().done
    }

    fn fifo_status(&self) -> FifoStatus {
        self.state().fifo_status
    }

    fn enable_interrupt(&mut self) {
        self.state().irq_enabled = true;
    }

    fn disable_interrupt(&mut self) {
        self.state().irq_enabled = false;
    }

    fn enable_burst(&mut self, enable: bool) {
        self.state().calls.push(HalCall::EnableBurst(enable));
    }

    unsafe fn start_burst(&mut self, tx: DescriptorChain, rx: Option<DescriptorChain>) {
        let mut state = self.state();
        state.calls.push(HalCall::StartBurst {
            tx: tx.len,
            rx: rx.map(|c| c.len),
        });
        Self::begin(&mut state);
    }
}

// =============================================================================
// Mock memory map
// =============================================================================

#[derive(Debug, Default)]
struct MemState {
    non_dma: Vec<Range<usize>>,
    external: Vec<Range<usize>>,
    cached: Vec<Range<usize>>,
    cache_line: usize,
    writebacks: Vec<(usize, usize)>,
    invalidations: Vec<(usize, usize)>,
}

fn hit(ranges: &[Range<usize>], addr: usize) -> bool {
    ranges.iter().any(|r| r.contains(&addr))
}

/// Mock memory map. Everything is internal, DMA-capable and uncached until
/// marked otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockMemory {
    state: Arc<Mutex<MemState>>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default().with_cache_line(32)
    }

    /// Cache line size reported as alignment for cached regions
    pub fn with_cache_line(self, bytes: usize) -> Self {
        self.state().cache_line = bytes;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap()
    }

    pub fn mark_non_dma(&self, addr: usize, len: usize) {
        self.state().non_dma.push(addr..addr + len);
    }

    pub fn mark_external(&self, addr: usize, len: usize) {
        self.state().external.push(addr..addr + len);
    }

    pub fn mark_cached(&self, addr: usize, len: usize) {
        self.state().cached.push(addr..addr + len);
    }

    pub fn writebacks(&self) -> Vec<(usize, usize)> {
        self.state().writebacks.clone()
    }

    pub fn invalidations(&self) -> Vec<(usize, usize)> {
        self.state().invalidations.clone()
    }
}

impl DmaMemory for MockMemory {
    fn is_dma_capable(&self, addr: usize, len: usize) -> bool {
        let state = self.state();
        let end = addr + len;
        !state.non_dma.iter().any(|r| r.start < end && addr < r.end)
    }

    fn alignment(&self, addr: usize) -> usize {
        let state = self.state();
        if hit(&state.cached, addr) {
            state.cache_line.max(crate::constants::DMA_INTERNAL_ALIGN)
        } else {
            crate::constants::DMA_INTERNAL_ALIGN
        }
    }

    fn is_external(&self, addr: usize) -> bool {
        hit(&self.state().external, addr)
    }

    fn is_cached(&self, addr: usize) -> bool {
        hit(&self.state().cached, addr)
    }

    fn writeback(&self, addr: usize, len: usize) {
        self.state().writebacks.push((addr, len));
    }

    fn invalidate(&self, addr: usize, len: usize) {
        self.state().invalidations.push((addr, len));
    }
}

// =============================================================================
// Mock delay
// =============================================================================

/// Delay provider that only counts time.
///
/// An optional hook runs on every delay, standing in for the interrupt
/// handler firing while a task waits.
#[derive(Default)]
pub struct MockDelay<'a> {
    total_ns: u64,
    hook: Option<Box<dyn FnMut() + 'a>>,
}

impl MockDelay<'static> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> MockDelay<'a> {
    pub fn with_hook(hook: impl FnMut() + 'a) -> Self {
        Self {
            total_ns: 0,
            hook: Some(Box::new(hook)),
        }
    }

    /// Total time waited
    pub fn total_ns(&self) -> u64 {
        self.total_ns
    }
}

impl DelayNs for MockDelay<'_> {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += u64::from(ns);
        if let Some(hook) = self.hook.as_mut() {
            hook();
        }
    }
}

// =============================================================================
// Bus fixtures
// =============================================================================

pub type TestBus = SpiBus<MockHal, SimpleBusLock, MockMemory>;

/// A bus on a fresh mock host; the returned handle shares its state.
pub fn test_bus(config: BusConfig) -> (TestBus, MockHal) {
    let hal = MockHal::new();
    let bus = TestBus::new(config, hal.clone(), SimpleBusLock::new(), MockMemory::new()).unwrap();
    (bus, hal)
}

/// Deliver the level-triggered done interrupt until it goes quiet.
pub fn pump(bus: &TestBus, hal: &MockHal) {
    for _ in 0..1024 {
        if !(hal.irq_enabled() && hal.is_done()) {
            return;
        }
        bus.on_interrupt();
    }
    panic!("interrupt never went quiet");
}

/// Deliver the done interrupt from the calling thread until `stop` is set.
///
/// Only this thread masks the interrupt, so a set mask seen here holds
/// until `on_interrupt` runs.
pub fn serve_interrupts(bus: &TestBus, hal: &MockHal, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        if hal.irq_enabled() && hal.is_done() {
            bus.on_interrupt();
        } else {
            std::thread::yield_now();
        }
    }
}

/// Counts devices between their pre- and post-transfer callbacks.
#[derive(Debug, Clone, Default)]
pub struct Occupancy {
    inside: Arc<AtomicUsize>,
    overlapped: Arc<AtomicBool>,
    transfers: Arc<AtomicUsize>,
}

impl Occupancy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the counting callbacks on a device configuration
    pub fn watch(&self, config: DeviceConfig) -> DeviceConfig {
        let enter = self.clone();
        let leave = self.clone();
        config
            .with_pre_transfer(move |_| {
                if enter.inside.fetch_add(1, Ordering::SeqCst) != 0 {
                    enter.overlapped.store(true, Ordering::SeqCst);
                }
            })
            .with_post_transfer(move |_| {
                leave.inside.fetch_sub(1, Ordering::SeqCst);
                leave.transfers.fetch_add(1, Ordering::SeqCst);
            })
    }

    /// Whether two devices were ever on the bus together
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }
}
