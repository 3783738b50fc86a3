use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;
use pinrdma_types::ProcessId;

use crate::context::MemoryContext;
use crate::error::MemError;
use crate::memory::{MemorySubsystem, PageRef};
use crate::page::{self, PAGE_SIZE};
use crate::pinner::PagePinner;
use crate::registry::{TableKey, TableRegistry};

/// A directly addressable slice of one pinned page.
#[derive(Debug, Clone, Copy)]
pub struct ByteWindow {
    page: PageRef,
    base: NonNull<u8>,
    len: usize,
}

// The pointer targets a pinned, mapped page owned by the enclosing table;
// all access goes through the table's liveness lock.
unsafe impl Send for ByteWindow {}
unsafe impl Sync for ByteWindow {}

impl ByteWindow {
    pub fn page(&self) -> PageRef {
        self.page
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-page windows over a pinned user range, clipped to the requested bytes.
pub struct ByteWindowTable {
    key: TableKey,
    ctx: Arc<MemoryContext>,
    mem: Arc<dyn MemorySubsystem>,
    virt_addr: u64,
    length: u64,
    windows: Vec<ByteWindow>,
    /// `false` once released; readers hold it shared while touching memory.
    live: RwLock<bool>,
}

impl std::fmt::Debug for ByteWindowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteWindowTable")
            .field("key", &self.key)
            .field("virt_addr", &format_args!("{:#x}", self.virt_addr))
            .field("length", &self.length)
            .field("windows", &self.windows)
            .finish()
    }
}

impl ByteWindowTable {
    pub fn key(&self) -> TableKey {
        self.key
    }

    pub fn virt_addr(&self) -> u64 {
        self.virt_addr
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn windows(&self) -> &[ByteWindow] {
        &self.windows
    }

    pub fn is_released(&self) -> bool {
        !*self.live.read()
    }

    /// Copy bytes starting at logical `offset` into `buf`. Returns the number
    /// copied, which is short only at the end of the range.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<usize, MemError> {
        let live = self.live.read();
        if !*live {
            return Err(MemError::Released(self.key));
        }
        let mut done = 0;
        self.for_each_span(offset, buf.len(), |src, n| {
            // SAFETY: `src` lies inside a window of a page that stays pinned
            // and mapped while `live` is held.
            unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr().add(done), n) };
            done += n;
        });
        Ok(done)
    }

    /// Copy `data` into the range starting at logical `offset`.
    pub fn write_from(&self, offset: u64, data: &[u8]) -> Result<usize, MemError> {
        let live = self.live.read();
        if !*live {
            return Err(MemError::Released(self.key));
        }
        let mut done = 0;
        self.for_each_span(offset, data.len(), |dst, n| {
            // SAFETY: as in `read_into`; the page is writable user memory.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr().add(done), dst, n) };
            done += n;
        });
        Ok(done)
    }

    fn for_each_span(&self, offset: u64, len: usize, mut f: impl FnMut(*mut u8, usize)) {
        let mut skip = offset as usize;
        let mut want = len;
        for w in &self.windows {
            if want == 0 {
                break;
            }
            if skip >= w.len {
                skip -= w.len;
                continue;
            }
            let n = (w.len - skip).min(want);
            // SAFETY: `skip < w.len`, so the pointer stays inside the window.
            f(unsafe { w.base.as_ptr().add(skip) }, n);
            want -= n;
            skip = 0;
        }
    }

    fn release_pages(&self) {
        let mut live = self.live.write();
        if !*live {
            return;
        }
        *live = false;
        for w in &self.windows {
            self.mem.unmap_page_address(w.page);
            self.mem.drop_reference(w.page);
        }
        self.ctx.uncharge(self.windows.len() as u64);
        tracing::debug!(table = %self.key, npages = self.windows.len(), "byte-window table released");
    }
}

impl Drop for ByteWindowTable {
    fn drop(&mut self) {
        self.release_pages();
    }
}

/// Pins user ranges and maps each page for direct access.
pub struct WindowMapper {
    pinner: PagePinner,
    registry: TableRegistry<ByteWindowTable>,
}

impl WindowMapper {
    pub fn new(mem: Arc<dyn MemorySubsystem>) -> Self {
        Self {
            pinner: PagePinner::new(mem),
            registry: TableRegistry::new(),
        }
    }

    pub fn registry(&self) -> &TableRegistry<ByteWindowTable> {
        &self.registry
    }

    pub fn map(
        &self,
        ctx: &Arc<MemoryContext>,
        virt_addr: u64,
        length: u64,
    ) -> Result<Arc<ByteWindowTable>, MemError> {
        let set = self.pinner.pin(ctx, virt_addr, length)?;
        let mem = self.pinner.memory();
        let end = virt_addr + length;

        let mut windows: Vec<ByteWindow> = Vec::with_capacity(set.len());
        let mut cur = virt_addr;
        for &page in set.pages() {
            let base = match mem.map_page_address(page) {
                Ok(base) => base,
                Err(err) => {
                    for w in &windows {
                        mem.unmap_page_address(w.page);
                    }
                    return Err(err);
                }
            };
            let off = page::page_offset(cur);
            let next = page::align_down(cur) + PAGE_SIZE;
            let len = next.min(end) - cur;
            // SAFETY: `off < PAGE_SIZE` and the mapping covers the page.
            let base = unsafe { NonNull::new_unchecked(base.as_ptr().add(off as usize)) };
            windows.push(ByteWindow { page, base, len: len as usize });
            cur = next;
        }

        let key = self.registry.next_key(ctx.pid());
        // Each window now holds its page's reference and share of the charge.
        let npages = set.into_pages().len();
        let table = Arc::new(ByteWindowTable {
            key,
            ctx: ctx.clone(),
            mem: mem.clone(),
            virt_addr,
            length,
            windows,
            live: RwLock::new(true),
        });
        self.registry.insert(key, table.clone());
        tracing::debug!(table = %key, virt_addr, length, npages, "byte-window table mapped");
        Ok(table)
    }

    /// Unregister and release; the registry entry is found from the table itself.
    pub fn release(&self, table: &ByteWindowTable) -> Result<(), MemError> {
        let entry = self
            .registry
            .remove(&table.key())
            .ok_or(MemError::NotRegistered(table.key()))?;
        entry.release_pages();
        Ok(())
    }

    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<ByteWindowTable>> {
        self.registry.lookup_pid(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FrameLayout, SimMemory};

    const BASE: u64 = 0x6600_0000_0000;

    fn setup(pages: u64) -> (Arc<SimMemory>, WindowMapper, Arc<MemoryContext>) {
        let mem = Arc::new(SimMemory::new());
        let ctx = Arc::new(MemoryContext::new(ProcessId(9), 64));
        mem.map_user(ctx.pid(), BASE, pages * PAGE_SIZE, FrameLayout::Scattered);
        let mapper = WindowMapper::new(mem.clone());
        (mem, mapper, ctx)
    }

    fn window_lengths(table: &ByteWindowTable) -> Vec<usize> {
        table.windows().iter().map(ByteWindow::len).collect()
    }

    #[test]
    fn test_windows_clipped_at_both_ends() {
        let (_mem, mapper, ctx) = setup(3);
        let table = mapper.map(&ctx, BASE + 0x100, 2 * PAGE_SIZE).unwrap();
        assert_eq!(window_lengths(&table), vec![0xf00, 0x1000, 0x100]);
        let total: usize = window_lengths(&table).iter().sum();
        assert_eq!(total as u64, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_window_within_one_page() {
        let (_mem, mapper, ctx) = setup(1);
        let table = mapper.map(&ctx, BASE + 0x10, 0x20).unwrap();
        assert_eq!(window_lengths(&table), vec![0x20]);
    }

    #[test]
    fn test_aligned_range_has_full_windows() {
        let (_mem, mapper, ctx) = setup(2);
        let table = mapper.map(&ctx, BASE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(window_lengths(&table), vec![0x1000, 0x1000]);
    }

    #[test]
    fn test_read_write_reach_user_memory() {
        let (mem, mapper, ctx) = setup(2);
        mem.write_user(ctx.pid(), BASE + 0xff0, b"0123456789abcdefXYZ").unwrap();
        let table = mapper.map(&ctx, BASE + 0xff0, 0x20).unwrap();

        let mut buf = [0u8; 19];
        assert_eq!(table.read_into(0, &mut buf).unwrap(), 19);
        assert_eq!(&buf, b"0123456789abcdefXYZ");

        assert_eq!(table.write_from(14, b"--").unwrap(), 2);
        assert_eq!(mem.read_user(ctx.pid(), BASE + 0xffe, 2).unwrap(), b"--");

        // Reads past the end are short.
        let mut tail = [0u8; 8];
        assert_eq!(table.read_into(0x1c, &mut tail).unwrap(), 4);
    }

    #[test]
    fn test_release_unmaps_and_uncharges() {
        let (mem, mapper, ctx) = setup(2);
        let table = mapper.map(&ctx, BASE, 2 * PAGE_SIZE).unwrap();
        let pfn = mem.physical_frame_of(table.windows()[0].page());
        assert_eq!(mem.kmapped(pfn), 1);
        assert_eq!(mapper.lookup(ctx.pid()).unwrap().key(), table.key());

        mapper.release(&table).unwrap();
        assert_eq!(mem.kmapped(pfn), 0);
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(mem.total_extra_references(), 0);
        assert!(mapper.lookup(ctx.pid()).is_none());
        assert!(matches!(table.read_into(0, &mut [0u8; 1]), Err(MemError::Released(_))));
        assert!(mapper.release(&table).is_err());
    }

    #[test]
    fn test_kmap_failure_unwinds() {
        let (mem, mapper, ctx) = setup(3);
        mem.fail_kmap_on_call(3);
        let err = mapper.map(&ctx, BASE, 3 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, MemError::KmapFailed(_)));
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(mem.total_extra_references(), 0);
        let first = mem.frame_of(ctx.pid(), BASE).unwrap();
        assert_eq!(mem.kmapped(first), 0);
        assert!(mapper.registry().is_empty());
    }
}
