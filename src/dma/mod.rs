//! DMA support
//!
//! - `buffer`: turns caller buffers into DMA-safe ones, staging through an
//!   aligned temporary when needed
//! - [`descriptor`]: the linked-list hardware descriptor
//! - `ring`: the descriptor pools shared by segmented bursts
//!
//! Plain transfers hand a single buffer to the HAL; only segmented bursts
//! build descriptor chains.

pub(crate) mod buffer;
pub mod descriptor;
pub(crate) mod ring;

pub use descriptor::DmaDescriptor;
pub use ring::{DescriptorChain, DescriptorPool};

pub(crate) use buffer::{PreparedBuffers, Stage, dma_ready};
pub(crate) use ring::SlotRun;
