//! In-process memory model.
//!
//! [`SimMemory`] stands in for the platform's page tables, page reference
//! counts, IOMMU and kernel mappings. Each process gets its own virtual page
//! map; frames are real heap buffers so data written through DMA or a byte
//! window is observable from the "user" side.

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use pinrdma_types::{Iova, Pfn, ProcessId};

use crate::context::MemoryContext;
use crate::error::MemError;
use crate::memory::{DmaMapping, DmaSegment, MemorySubsystem, PageRef};
use crate::page::{self, PAGE_SHIFT, PAGE_SIZE};
use crate::sg::SgSegment;

const FIRST_PFN: u64 = 0x1000;
const FIRST_IOVA: u64 = 0x1_0000_0000;

/// Ordered record of side effects, shared between simulated components so
/// tests can assert on cross-component teardown order.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    /// Index of the first event containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e.contains(needle))
    }
}

/// How frames are assigned to a freshly mapped user range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameLayout {
    /// Consecutive frame numbers.
    Contiguous,
    /// A one-frame gap after every page; nothing coalesces.
    Scattered,
    /// Exactly these frames, one per page.
    Custom(Vec<Pfn>),
}

struct Frame {
    data: Box<[u8]>,
    refs: u32,
    kmapped: u32,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
            refs: 0,
            kmapped: 0,
        }
    }
}

struct DmaRegion {
    len: u64,
    chunks: Vec<SgSegment>,
}

#[derive(Default)]
struct SimState {
    next_pfn: u64,
    frames: BTreeMap<Pfn, Frame>,
    user: HashMap<(ProcessId, u64), Pfn>,
    max_pages_per_call: Option<usize>,
    pin_overshoot: usize,
    pin_calls: usize,
    fail_pin_call: Option<usize>,
    fail_dma_map: bool,
    kmap_calls: usize,
    fail_kmap_call: Option<usize>,
    next_iova: u64,
    dma: BTreeMap<u64, DmaRegion>,
}

pub struct SimMemory {
    state: Mutex<SimState>,
    events: EventLog,
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMemory {
    pub fn new() -> Self {
        Self::with_events(EventLog::new())
    }

    pub fn with_events(events: EventLog) -> Self {
        Self {
            state: Mutex::new(SimState {
                next_pfn: FIRST_PFN,
                next_iova: FIRST_IOVA,
                ..Default::default()
            }),
            events,
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Back `[addr, addr + len)` of `pid`'s address space with frames.
    /// Pages already mapped keep their frame.
    pub fn map_user(&self, pid: ProcessId, addr: u64, len: u64, layout: FrameLayout) {
        let mut st = self.state.lock();
        let first_vpn = addr >> PAGE_SHIFT;
        let count = page::npages(addr, len);
        for i in 0..count {
            let vpn = first_vpn + i;
            if st.user.contains_key(&(pid, vpn)) {
                continue;
            }
            let pfn = match &layout {
                FrameLayout::Contiguous => {
                    let pfn = Pfn(st.next_pfn);
                    st.next_pfn += 1;
                    pfn
                }
                FrameLayout::Scattered => {
                    let pfn = Pfn(st.next_pfn);
                    st.next_pfn += 2;
                    pfn
                }
                FrameLayout::Custom(pfns) => match pfns.get(i as usize) {
                    Some(&pfn) => {
                        st.next_pfn = st.next_pfn.max(pfn.get() + 1);
                        pfn
                    }
                    None => break,
                },
            };
            // The mapping itself holds the first reference.
            st.frames.entry(pfn).or_insert_with(Frame::new).refs += 1;
            st.user.insert((pid, vpn), pfn);
        }
    }

    /// Copy `data` into `pid`'s memory as the process itself would.
    pub fn write_user(&self, pid: ProcessId, addr: u64, data: &[u8]) -> Result<(), MemError> {
        let mut st = self.state.lock();
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr + done as u64;
            let pfn = st.user_frame(pid, cur)?;
            let off = page::page_offset(cur) as usize;
            let n = (PAGE_SIZE as usize - off).min(data.len() - done);
            let frame = st.frame_mut(pfn)?;
            frame.data[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub fn read_user(&self, pid: ProcessId, addr: u64, len: usize) -> Result<Vec<u8>, MemError> {
        let mut st = self.state.lock();
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let cur = addr + out.len() as u64;
            let pfn = st.user_frame(pid, cur)?;
            let off = page::page_offset(cur) as usize;
            let n = (PAGE_SIZE as usize - off).min(len - out.len());
            let frame = st.frame_mut(pfn)?;
            out.extend_from_slice(&frame.data[off..off + n]);
        }
        Ok(out)
    }

    /// Write through a device address, as a DMA engine would.
    pub fn dma_write(&self, iova: Iova, data: &[u8]) -> Result<(), MemError> {
        let mut st = self.state.lock();
        let targets = st.resolve_iova(iova, data.len() as u64)?;
        let mut done = 0usize;
        for (pfn, off, n) in targets {
            let frame = st.frame_mut(pfn)?;
            frame.data[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub fn dma_read(&self, iova: Iova, len: usize) -> Result<Vec<u8>, MemError> {
        let mut st = self.state.lock();
        let targets = st.resolve_iova(iova, len as u64)?;
        let mut out = Vec::with_capacity(len);
        for (pfn, off, n) in targets {
            let frame = st.frame_mut(pfn)?;
            out.extend_from_slice(&frame.data[off..off + n]);
        }
        Ok(out)
    }

    /// Cap the pages returned by one `pin_range` call.
    pub fn set_max_pages_per_call(&self, max: Option<usize>) {
        self.state.lock().max_pages_per_call = max;
    }

    /// Make `pin_range` append up to `extra` mapped pages past the count it
    /// was asked for, like a provider that ignores its limit.
    pub fn set_pin_overshoot(&self, extra: usize) {
        self.state.lock().pin_overshoot = extra;
    }

    /// Make the `n`th (1-based) `pin_range` call fail with `OutOfMemory`.
    pub fn fail_pin_on_call(&self, n: usize) {
        self.state.lock().fail_pin_call = Some(n);
    }

    pub fn fail_dma_map(&self, fail: bool) {
        self.state.lock().fail_dma_map = fail;
    }

    /// Make the `n`th (1-based) `map_page_address` call fail.
    pub fn fail_kmap_on_call(&self, n: usize) {
        self.state.lock().fail_kmap_call = Some(n);
    }

    pub fn pin_calls(&self) -> usize {
        self.state.lock().pin_calls
    }

    pub fn refcount(&self, pfn: Pfn) -> u32 {
        self.state.lock().frames.get(&pfn).map_or(0, |f| f.refs)
    }

    pub fn kmapped(&self, pfn: Pfn) -> u32 {
        self.state.lock().frames.get(&pfn).map_or(0, |f| f.kmapped)
    }

    /// References held beyond each frame's own mapping, summed over all frames.
    pub fn total_extra_references(&self) -> u64 {
        self.state
            .lock()
            .frames
            .values()
            .map(|f| f.refs.saturating_sub(1) as u64)
            .sum()
    }

    pub fn active_dma_mappings(&self) -> usize {
        self.state.lock().dma.len()
    }

    /// Frame backing `addr` in `pid`'s address space, if mapped.
    pub fn frame_of(&self, pid: ProcessId, addr: u64) -> Option<Pfn> {
        self.state.lock().user.get(&(pid, addr >> PAGE_SHIFT)).copied()
    }
}

impl SimState {
    fn user_frame(&self, pid: ProcessId, addr: u64) -> Result<Pfn, MemError> {
        self.user
            .get(&(pid, addr >> PAGE_SHIFT))
            .copied()
            .ok_or(MemError::InvalidAddress { addr })
    }

    fn frame_mut(&mut self, pfn: Pfn) -> Result<&mut Frame, MemError> {
        self.frames
            .get_mut(&pfn)
            .ok_or(MemError::InvalidAddress { addr: pfn.get() << PAGE_SHIFT })
    }

    /// Split a device range into `(frame, offset in frame, bytes)` pieces.
    fn resolve_iova(&self, iova: Iova, len: u64) -> Result<Vec<(Pfn, usize, usize)>, MemError> {
        let fault = || MemError::DmaMapFailed(format!("unmapped device range {} +{}", iova, len));
        let (&start, region) = self.dma.range(..=iova.get()).next_back().ok_or_else(fault)?;
        let rel = iova.get() - start;
        if rel + len > region.len {
            return Err(fault());
        }

        let mut out = Vec::new();
        let mut skip = rel;
        let mut want = len;
        for chunk in &region.chunks {
            if want == 0 {
                break;
            }
            let chunk_len = chunk.length as u64;
            if skip >= chunk_len {
                skip -= chunk_len;
                continue;
            }
            let mut pos = chunk.offset as u64 + skip;
            let mut avail = chunk_len - skip;
            skip = 0;
            while avail > 0 && want > 0 {
                let pfn = Pfn(chunk.page.get()).offset(pos >> PAGE_SHIFT);
                let off = page::page_offset(pos);
                let n = (PAGE_SIZE - off).min(avail).min(want);
                out.push((pfn, off as usize, n as usize));
                pos += n;
                avail -= n;
                want -= n;
            }
        }
        Ok(out)
    }
}

impl MemorySubsystem for SimMemory {
    fn pin_range(
        &self,
        ctx: &MemoryContext,
        start: u64,
        max_pages: usize,
        out: &mut Vec<PageRef>,
    ) -> Result<usize, MemError> {
        let mut st = self.state.lock();
        st.pin_calls += 1;
        if st.fail_pin_call == Some(st.pin_calls) {
            return Err(MemError::OutOfMemory(format!("injected fault-in failure at {:#x}", start)));
        }

        let limit = st.max_pages_per_call.map_or(max_pages, |m| m.min(max_pages)) + st.pin_overshoot;
        let first_vpn = start >> PAGE_SHIFT;
        let mut got = 0;
        while got < limit {
            let Some(&pfn) = st.user.get(&(ctx.pid(), first_vpn + got as u64)) else {
                break;
            };
            st.frame_mut(pfn)?.refs += 1;
            out.push(PageRef(pfn.get()));
            got += 1;
        }
        Ok(got)
    }

    fn physical_frame_of(&self, page: PageRef) -> Pfn {
        Pfn(page.get())
    }

    fn page_of_frame(&self, pfn: Pfn) -> PageRef {
        PageRef(pfn.get())
    }

    fn drop_reference(&self, page: PageRef) {
        let mut st = self.state.lock();
        match st.frames.get_mut(&Pfn(page.get())) {
            Some(frame) if frame.refs > 0 => frame.refs -= 1,
            _ => tracing::error!(page = %page, "reference dropped on an unreferenced frame"),
        }
        drop(st);
        self.events.push(format!("put_page {}", page));
    }

    fn map_for_dma(&self, segments: &[SgSegment]) -> Result<DmaMapping, MemError> {
        if segments.is_empty() {
            return Err(MemError::InvalidArgument("empty scatter-gather list".into()));
        }
        let mut st = self.state.lock();
        if st.fail_dma_map {
            return Err(MemError::DmaMapFailed("injected".into()));
        }
        let len: u64 = segments.iter().map(|s| s.length as u64).sum();
        let iova = st.next_iova;
        // Leave an unmapped guard page between regions.
        st.next_iova += page::align_up(len).unwrap_or(len) + PAGE_SIZE;
        st.dma.insert(iova, DmaRegion { len, chunks: segments.to_vec() });
        drop(st);

        self.events.push(format!("dma_map {:#x} +{}", iova, len));
        Ok(DmaMapping {
            segments: vec![DmaSegment { iova: Iova(iova), len }],
        })
    }

    fn unmap_dma(&self, mapping: &DmaMapping) {
        let mut st = self.state.lock();
        for seg in &mapping.segments {
            if st.dma.remove(&seg.iova.get()).is_none() {
                tracing::warn!(iova = %seg.iova, "unmapping an unknown DMA region");
            }
        }
        drop(st);
        if let Some(iova) = mapping.first_address() {
            self.events.push(format!("dma_unmap {}", iova));
        }
    }

    fn map_page_address(&self, page: PageRef) -> Result<NonNull<u8>, MemError> {
        let mut st = self.state.lock();
        st.kmap_calls += 1;
        if st.fail_kmap_call == Some(st.kmap_calls) {
            return Err(MemError::KmapFailed(Pfn(page.get())));
        }
        let frame = st.frame_mut(Pfn(page.get()))?;
        frame.kmapped += 1;
        NonNull::new(frame.data.as_mut_ptr()).ok_or(MemError::KmapFailed(Pfn(page.get())))
    }

    fn unmap_page_address(&self, page: PageRef) {
        let mut st = self.state.lock();
        if let Some(frame) = st.frames.get_mut(&Pfn(page.get())) {
            frame.kmapped = frame.kmapped.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: ProcessId = ProcessId(5);

    #[test]
    fn test_layouts() {
        let mem = SimMemory::new();
        mem.map_user(PID, 0x10000, 2 * PAGE_SIZE, FrameLayout::Contiguous);
        let a = mem.frame_of(PID, 0x10000).unwrap();
        let b = mem.frame_of(PID, 0x11000).unwrap();
        assert_eq!(b, a.offset(1));

        mem.map_user(PID, 0x20000, 2 * PAGE_SIZE, FrameLayout::Scattered);
        let c = mem.frame_of(PID, 0x20000).unwrap();
        let d = mem.frame_of(PID, 0x21000).unwrap();
        assert_eq!(d, c.offset(2));

        mem.map_user(PID, 0x30000, PAGE_SIZE, FrameLayout::Custom(vec![Pfn(0x9000)]));
        assert_eq!(mem.frame_of(PID, 0x30000), Some(Pfn(0x9000)));
        assert_eq!(mem.refcount(Pfn(0x9000)), 1);
    }

    #[test]
    fn test_user_io_crosses_pages() {
        let mem = SimMemory::new();
        mem.map_user(PID, 0x10000, 2 * PAGE_SIZE, FrameLayout::Scattered);
        mem.write_user(PID, 0x10ffe, b"abcd").unwrap();
        assert_eq!(mem.read_user(PID, 0x10ffe, 4).unwrap(), b"abcd");
        assert!(mem.read_user(PID, 0x12000, 1).is_err());
    }

    #[test]
    fn test_dma_roundtrip_through_segments() {
        let mem = SimMemory::new();
        mem.map_user(PID, 0x10000, 3 * PAGE_SIZE, FrameLayout::Scattered);
        let segs: Vec<SgSegment> = (0..3u64)
            .map(|i| SgSegment {
                page: PageRef(mem.frame_of(PID, 0x10000 + i * PAGE_SIZE).unwrap().get()),
                length: PAGE_SIZE as u32,
                offset: 0,
            })
            .collect();
        let mapping = mem.map_for_dma(&segs).unwrap();
        assert_eq!(mapping.nents(), 1);
        assert_eq!(mapping.total_len(), 3 * PAGE_SIZE);

        let iova = mapping.first_address().unwrap().advance(PAGE_SIZE - 2);
        mem.dma_write(iova, b"wxyz").unwrap();
        assert_eq!(mem.read_user(PID, 0x10ffe, 4).unwrap(), b"wxyz");
        assert_eq!(mem.dma_read(iova, 4).unwrap(), b"wxyz");

        mem.unmap_dma(&mapping);
        assert_eq!(mem.active_dma_mappings(), 0);
        assert!(mem.dma_read(iova, 1).is_err());
        let events = mem.events().snapshot();
        assert!(events[0].starts_with("dma_map"));
        assert!(events[1].starts_with("dma_unmap"));
    }

    #[test]
    fn test_dma_out_of_range() {
        let mem = SimMemory::new();
        mem.map_user(PID, 0x10000, PAGE_SIZE, FrameLayout::Contiguous);
        let seg = SgSegment {
            page: PageRef(mem.frame_of(PID, 0x10000).unwrap().get()),
            length: PAGE_SIZE as u32,
            offset: 0,
        };
        let mapping = mem.map_for_dma(&[seg]).unwrap();
        let base = mapping.first_address().unwrap();
        assert!(mem.dma_write(base.advance(PAGE_SIZE - 1), b"xy").is_err());
    }

    #[test]
    fn test_injected_failures() {
        let mem = SimMemory::new();
        mem.fail_dma_map(true);
        let seg = SgSegment { page: PageRef(FIRST_PFN), length: 1, offset: 0 };
        assert!(matches!(mem.map_for_dma(&[seg]), Err(MemError::DmaMapFailed(_))));

        mem.map_user(PID, 0x10000, PAGE_SIZE, FrameLayout::Contiguous);
        let page = PageRef(mem.frame_of(PID, 0x10000).unwrap().get());
        mem.fail_kmap_on_call(1);
        assert!(matches!(mem.map_page_address(page), Err(MemError::KmapFailed(_))));
        assert!(mem.map_page_address(page).is_ok());
        assert_eq!(mem.kmapped(Pfn(page.get())), 1);
    }
}
