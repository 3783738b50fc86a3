use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pinrdma_types::ProcessId;

use crate::context::MemoryContext;
use crate::error::MemError;
use crate::memory::{MemorySubsystem, PageRef};
use crate::page::{self, PAGE_SHIFT};
use crate::pinner::PagePinner;
use crate::registry::{TableKey, TableRegistry};

/// A physically contiguous run of pinned pages starting at `page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    pub page: PageRef,
    pub length: u32,
    pub offset: u32,
}

impl SgSegment {
    /// Pages covered by this segment.
    pub fn npages(&self) -> u64 {
        page::npages(self.offset as u64, self.length as u64)
    }
}

/// Scatter-gather description of a pinned user range.
///
/// Owns one reference on every page it covers plus the matching charge on
/// its context. Both are returned by [`SgBuilder::release`], or when the last
/// handle is dropped after the table left the registry.
pub struct ScatterGatherTable {
    key: TableKey,
    ctx: Arc<MemoryContext>,
    mem: Arc<dyn MemorySubsystem>,
    virt_addr: u64,
    length: u64,
    npages: u64,
    segments: Vec<SgSegment>,
    released: AtomicBool,
}

impl ScatterGatherTable {
    pub fn key(&self) -> TableKey {
        self.key
    }

    pub fn pid(&self) -> ProcessId {
        self.key.pid
    }

    pub fn virt_addr(&self) -> u64 {
        self.virt_addr
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn npages(&self) -> u64 {
        self.npages
    }

    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    pub fn nents(&self) -> usize {
        self.segments.len()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Drop the page references and the context charge. Idempotent.
    fn release_pages(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut total = 0u64;
        for seg in &self.segments {
            let head = self.mem.physical_frame_of(seg.page);
            let count = seg.npages();
            for j in 0..count {
                self.mem.drop_reference(self.mem.page_of_frame(head.offset(j)));
            }
            total += count;
        }
        if total != self.npages {
            tracing::warn!(table = %self.key, total, npages = self.npages, "segment page count mismatch");
        }
        self.ctx.uncharge(total);
        tracing::debug!(table = %self.key, npages = total, "scatter-gather table released");
    }
}

impl Drop for ScatterGatherTable {
    fn drop(&mut self) {
        self.release_pages();
    }
}

impl std::fmt::Debug for ScatterGatherTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatterGatherTable")
            .field("key", &self.key)
            .field("virt_addr", &format_args!("{:#x}", self.virt_addr))
            .field("length", &self.length)
            .field("npages", &self.npages)
            .field("segments", &self.segments)
            .finish()
    }
}

/// Builds, registers and releases scatter-gather tables.
pub struct SgBuilder {
    pinner: PagePinner,
    registry: TableRegistry<ScatterGatherTable>,
}

impl SgBuilder {
    pub fn new(mem: Arc<dyn MemorySubsystem>) -> Self {
        Self {
            pinner: PagePinner::new(mem),
            registry: TableRegistry::new(),
        }
    }

    pub fn memory(&self) -> &Arc<dyn MemorySubsystem> {
        self.pinner.memory()
    }

    pub fn registry(&self) -> &TableRegistry<ScatterGatherTable> {
        &self.registry
    }

    /// Pin `[virt_addr, virt_addr + length)` and coalesce it into segments of
    /// at most `max_segment_size` bytes.
    pub fn build(
        &self,
        ctx: &Arc<MemoryContext>,
        virt_addr: u64,
        length: u64,
        max_segment_size: u32,
    ) -> Result<Arc<ScatterGatherTable>, MemError> {
        let max_seg_pages = (max_segment_size >> PAGE_SHIFT) as usize;
        if max_seg_pages == 0 {
            return Err(MemError::InvalidArgument(format!(
                "max segment size {} is below one page",
                max_segment_size
            )));
        }

        let set = self.pinner.pin(ctx, virt_addr, length)?;
        let mem = self.memory();
        let pages = set.pages();

        let mut segments = Vec::new();
        let mut i = 0;
        while i < pages.len() {
            let head = pages[i];
            let head_pfn = mem.physical_frame_of(head);
            let mut run = 1;
            while i + run < pages.len()
                && run < max_seg_pages
                && mem.physical_frame_of(pages[i + run]) == head_pfn.offset(run as u64)
            {
                run += 1;
            }
            segments.push(SgSegment {
                page: head,
                length: (run << PAGE_SHIFT) as u32,
                offset: 0,
            });
            i += run;
        }

        let key = self.registry.next_key(ctx.pid());
        // The table takes over one reference per page and the charge;
        // release recomputes both from the segments.
        let npages = set.into_pages().len() as u64;
        let table = Arc::new(ScatterGatherTable {
            key,
            ctx: ctx.clone(),
            mem: mem.clone(),
            virt_addr,
            length,
            npages,
            segments,
            released: AtomicBool::new(false),
        });
        self.registry.insert(key, table.clone());

        tracing::debug!(
            table = %key,
            virt_addr,
            length,
            npages,
            nents = table.nents(),
            "scatter-gather table built"
        );
        Ok(table)
    }

    /// Unregister `table` and release its pages.
    pub fn release(&self, table: &ScatterGatherTable) -> Result<(), MemError> {
        self.release_key(&table.key())
    }

    pub fn release_key(&self, key: &TableKey) -> Result<(), MemError> {
        let table = self.registry.remove(key).ok_or(MemError::NotRegistered(*key))?;
        table.release_pages();
        Ok(())
    }

    /// Oldest table still registered for `pid`.
    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<ScatterGatherTable>> {
        self.registry.lookup_pid(pid)
    }

    pub fn get(&self, key: &TableKey) -> Option<Arc<ScatterGatherTable>> {
        self.registry.get(key)
    }

    /// Release every table registered for `pid`; returns how many.
    pub fn release_for_process(&self, pid: ProcessId) -> usize {
        self.registry
            .keys_for_pid(pid)
            .iter()
            .filter(|key| self.release_key(key).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;
    use crate::sim::{FrameLayout, SimMemory};
    use pinrdma_types::Pfn;

    const BASE: u64 = 0x5500_0000_0000;
    const MAX_SEG: u32 = 1 << 16;

    fn setup(layout: FrameLayout, pages: u64) -> (Arc<SimMemory>, SgBuilder, Arc<MemoryContext>) {
        let mem = Arc::new(SimMemory::new());
        let ctx = Arc::new(MemoryContext::new(ProcessId(77), 1024));
        mem.map_user(ctx.pid(), BASE, pages * PAGE_SIZE, layout);
        let builder = SgBuilder::new(mem.clone());
        (mem, builder, ctx)
    }

    fn lengths(table: &ScatterGatherTable) -> Vec<u32> {
        table.segments().iter().map(|s| s.length).collect()
    }

    #[test]
    fn test_contiguous_frames_make_one_segment() {
        let (_mem, builder, ctx) = setup(FrameLayout::Contiguous, 8);
        let table = builder.build(&ctx, BASE, 8 * PAGE_SIZE, MAX_SEG).unwrap();
        assert_eq!(table.nents(), 1);
        assert_eq!(lengths(&table), vec![8 * PAGE_SIZE as u32]);
        assert_eq!(table.npages(), 8);
    }

    #[test]
    fn test_scattered_frames_make_one_segment_each() {
        let (_mem, builder, ctx) = setup(FrameLayout::Scattered, 5);
        let table = builder.build(&ctx, BASE, 5 * PAGE_SIZE, MAX_SEG).unwrap();
        assert_eq!(table.nents(), 5);
        assert!(table.segments().iter().all(|s| s.length == PAGE_SIZE as u32 && s.offset == 0));
    }

    #[test]
    fn test_segment_size_cap() {
        let (_mem, builder, ctx) = setup(FrameLayout::Contiguous, 8);
        let table = builder.build(&ctx, BASE, 8 * PAGE_SIZE, 3 * PAGE_SIZE as u32).unwrap();
        let p = PAGE_SIZE as u32;
        assert_eq!(lengths(&table), vec![3 * p, 3 * p, 2 * p]);
    }

    #[test]
    fn test_mixed_runs() {
        let pfns = [0x10, 0x11, 0x12, 0x20, 0x21, 0x30].map(Pfn).to_vec();
        let (mem, builder, ctx) = setup(FrameLayout::Custom(pfns), 6);
        let table = builder.build(&ctx, BASE, 6 * PAGE_SIZE, MAX_SEG).unwrap();
        let p = PAGE_SIZE as u32;
        assert_eq!(lengths(&table), vec![3 * p, 2 * p, p]);
        let heads: Vec<Pfn> = table.segments().iter().map(|s| mem.physical_frame_of(s.page)).collect();
        assert_eq!(heads, vec![Pfn(0x10), Pfn(0x20), Pfn(0x30)]);
    }

    #[test]
    fn test_unaligned_range_covers_touched_pages() {
        let (_mem, builder, ctx) = setup(FrameLayout::Contiguous, 3);
        let table = builder.build(&ctx, BASE + 0x800, PAGE_SIZE + 0x900, MAX_SEG).unwrap();
        assert_eq!(table.npages(), 3);
        assert_eq!(ctx.pinned_pages(), 3);
    }

    #[test]
    fn test_release_restores_counter_and_references() {
        let (mem, builder, ctx) = setup(FrameLayout::Custom([1, 2, 5].map(Pfn).to_vec()), 3);
        let table = builder.build(&ctx, BASE, 3 * PAGE_SIZE, MAX_SEG).unwrap();
        assert_eq!(table.npages(), 3);
        assert_eq!(ctx.pinned_pages(), 3);
        assert_eq!(mem.total_extra_references(), 3);

        builder.release(&table).unwrap();
        assert!(table.is_released());
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(mem.total_extra_references(), 0);
        assert!(builder.lookup(ctx.pid()).is_none());

        assert!(matches!(builder.release(&table), Err(MemError::NotRegistered(_))));
        drop(table);
        assert_eq!(ctx.pinned_pages(), 0);
    }

    #[test]
    fn test_lookup_by_pid() {
        let (mem, builder, ctx) = setup(FrameLayout::Contiguous, 4);
        let first = builder.build(&ctx, BASE, PAGE_SIZE, MAX_SEG).unwrap();
        let _second = builder.build(&ctx, BASE + PAGE_SIZE, PAGE_SIZE, MAX_SEG).unwrap();
        assert_eq!(builder.lookup(ctx.pid()).unwrap().key(), first.key());
        assert!(builder.lookup(ProcessId(1)).is_none());

        assert_eq!(builder.release_for_process(ctx.pid()), 2);
        assert!(builder.registry().is_empty());
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(mem.total_extra_references(), 0);
    }

    #[test]
    fn test_invalid_segment_size() {
        let (mem, builder, ctx) = setup(FrameLayout::Contiguous, 1);
        let err = builder.build(&ctx, BASE, PAGE_SIZE, 100).unwrap_err();
        assert!(matches!(err, MemError::InvalidArgument(_)));
        assert_eq!(mem.pin_calls(), 0);
    }

    #[test]
    fn test_failed_pin_registers_nothing() {
        let (_mem, builder, ctx) = setup(FrameLayout::Contiguous, 1);
        let err = builder.build(&ctx, BASE, 2 * PAGE_SIZE, MAX_SEG).unwrap_err();
        assert!(matches!(err, MemError::InvalidAddress { .. }));
        assert!(builder.registry().is_empty());
        assert_eq!(ctx.pinned_pages(), 0);
    }
}
