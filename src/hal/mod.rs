//! Hardware collaborators
//!
//! The engine never touches registers itself. It drives the controller
//! through [`SpiHal`] and asks [`DmaMemory`] where a buffer lives, so the
//! same dispatch logic runs on silicon and against host-side mocks.
//!
//! # Modules
//!
//! - `host`: controller operations ([`SpiHal`], [`HwTransaction`])
//! - `memory`: DMA capability and cache maintenance ([`DmaMemory`])

mod host;
mod memory;

pub use crate::dma::DescriptorChain;
pub use host::{FifoStatus, HwTransaction, LineMode, SpiHal};
pub use memory::{DmaMemory, InternalMemory};
