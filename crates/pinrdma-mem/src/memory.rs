//! The physical-memory seam.
//!
//! Everything the pinning layer needs from the platform goes through
//! [`MemorySubsystem`]: faulting in and referencing user pages, translating
//! between page handles and frame numbers, mapping segments for device DMA,
//! and mapping single pages into the caller's address space.

use std::ptr::NonNull;

use pinrdma_types::{Iova, Pfn};

use crate::context::MemoryContext;
use crate::error::MemError;
use crate::sg::SgSegment;

pinrdma_types::strong_type!(PageRef, u64, hex);

/// One contiguous device-visible range produced by [`MemorySubsystem::map_for_dma`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub iova: Iova,
    pub len: u64,
}

/// The device view of a scatter-gather table.
///
/// An IOMMU may merge several segments into one, so `segments` can be
/// shorter than the table it was made from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaMapping {
    pub segments: Vec<DmaSegment>,
}

impl DmaMapping {
    pub fn nents(&self) -> usize {
        self.segments.len()
    }

    /// Device address of the first mapped byte.
    pub fn first_address(&self) -> Option<Iova> {
        self.segments.first().map(|s| s.iova)
    }

    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }
}

pub trait MemorySubsystem: Send + Sync {
    /// Fault in up to `max_pages` pages starting at the page-aligned `start`
    /// in `ctx`'s address space, take one reference on each and append them
    /// to `out`.
    ///
    /// May return fewer pages than requested. Returning zero means the page
    /// at `start` is not mapped.
    fn pin_range(
        &self,
        ctx: &MemoryContext,
        start: u64,
        max_pages: usize,
        out: &mut Vec<PageRef>,
    ) -> Result<usize, MemError>;

    fn physical_frame_of(&self, page: PageRef) -> Pfn;

    fn page_of_frame(&self, pfn: Pfn) -> PageRef;

    fn drop_reference(&self, page: PageRef);

    fn map_for_dma(&self, segments: &[SgSegment]) -> Result<DmaMapping, MemError>;

    fn unmap_dma(&self, mapping: &DmaMapping);

    /// Map a pinned page and return the address of its first byte. The
    /// mapping covers the whole page and stays valid until
    /// [`unmap_page_address`](Self::unmap_page_address).
    fn map_page_address(&self, page: PageRef) -> Result<NonNull<u8>, MemError>;

    fn unmap_page_address(&self, page: PageRef);
}
