//! Pinned user memory for zero-copy transfers.
//!
//! A user virtual range is pinned into stable physical frames by
//! [`PagePinner`], charged against the owning [`MemoryContext`]'s quota, and
//! then consumed by one of two builders:
//!
//! - [`SgBuilder`] coalesces physically contiguous frames into a
//!   [`ScatterGatherTable`] suitable for DMA mapping.
//! - [`WindowMapper`] maps every page and produces a [`ByteWindowTable`] of
//!   directly addressable windows clipped to the requested bytes.
//!
//! Both register their tables in a [`TableRegistry`] keyed by
//! `(process, session)`. The physical memory itself sits behind the
//! [`MemorySubsystem`] trait; [`sim::SimMemory`] implements it in-process.

pub mod context;
pub mod error;
pub mod memory;
pub mod page;
pub mod pinner;
pub mod registry;
pub mod sg;
pub mod sim;
pub mod window;

pub use context::{MemoryContext, PinConfig};
pub use error::MemError;
pub use memory::{DmaMapping, DmaSegment, MemorySubsystem, PageRef};
pub use pinner::{PagePinner, PinnedPageSet};
pub use registry::{TableKey, TableRegistry};
pub use sg::{ScatterGatherTable, SgBuilder, SgSegment};
pub use window::{ByteWindow, ByteWindowTable, WindowMapper};
