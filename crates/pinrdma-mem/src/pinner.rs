use std::sync::Arc;

use crate::context::MemoryContext;
use crate::error::MemError;
use crate::memory::{MemorySubsystem, PageRef};
use crate::page;

/// A run of pinned pages covering a user range, in virtual order.
///
/// Holds one reference per page and the matching charge on its context.
/// Dropping the set releases both; [`into_pages`](Self::into_pages) hands
/// them to a longer-lived owner instead.
pub struct PinnedPageSet {
    mem: Arc<dyn MemorySubsystem>,
    ctx: Arc<MemoryContext>,
    virt_addr: u64,
    length: u64,
    pages: Vec<PageRef>,
    charged: u64,
}

impl PinnedPageSet {
    pub fn virt_addr(&self) -> u64 {
        self.virt_addr
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn pages(&self) -> &[PageRef] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn context(&self) -> &Arc<MemoryContext> {
        &self.ctx
    }

    /// Give up ownership of the page references and the context charge.
    ///
    /// The caller becomes responsible for dropping one reference per page
    /// and uncharging `pages.len()` from the context.
    pub fn into_pages(mut self) -> Vec<PageRef> {
        self.charged = 0;
        std::mem::take(&mut self.pages)
    }
}

impl Drop for PinnedPageSet {
    fn drop(&mut self) {
        for &page in &self.pages {
            self.mem.drop_reference(page);
        }
        if self.charged > 0 {
            self.ctx.uncharge(self.charged);
        }
    }
}

impl std::fmt::Debug for PinnedPageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPageSet")
            .field("pid", &self.ctx.pid())
            .field("virt_addr", &format_args!("{:#x}", self.virt_addr))
            .field("length", &self.length)
            .field("pages", &self.pages.len())
            .finish()
    }
}

/// Pins user ranges through a [`MemorySubsystem`].
#[derive(Clone)]
pub struct PagePinner {
    mem: Arc<dyn MemorySubsystem>,
}

impl PagePinner {
    pub fn new(mem: Arc<dyn MemorySubsystem>) -> Self {
        Self { mem }
    }

    pub fn memory(&self) -> &Arc<dyn MemorySubsystem> {
        &self.mem
    }

    /// Pin every page touched by `[virt_addr, virt_addr + length)`.
    pub fn pin(
        &self,
        ctx: &Arc<MemoryContext>,
        virt_addr: u64,
        length: u64,
    ) -> Result<PinnedPageSet, MemError> {
        if length == 0 {
            return Err(MemError::InvalidArgument("zero-length range".into()));
        }
        if page::range_overflows(virt_addr, length) {
            return Err(MemError::RangeOverflow { addr: virt_addr, len: length });
        }
        if !ctx.can_pin() {
            return Err(MemError::PermissionDenied(ctx.pid()));
        }

        let npages = page::npages(virt_addr, length);
        if npages > u32::MAX as u64 {
            return Err(MemError::RangeOverflow { addr: virt_addr, len: length });
        }
        ctx.charge(npages)?;

        // From here on the set's Drop unwinds whatever was acquired.
        let mut set = PinnedPageSet {
            mem: self.mem.clone(),
            ctx: ctx.clone(),
            virt_addr,
            length,
            pages: Vec::with_capacity(npages as usize),
            charged: npages,
        };

        let mut cur = page::align_down(virt_addr);
        let mut remaining = npages as usize;
        while remaining > 0 {
            let before = set.pages.len();
            let reported = self.mem.pin_range(ctx, cur, remaining, &mut set.pages)?;
            // Only `remaining` pages are charged; anything past that is put back.
            let appended = set.pages.len() - before;
            if appended != reported || appended > remaining {
                tracing::warn!(
                    pid = %ctx.pid(),
                    addr = cur,
                    requested = remaining,
                    reported,
                    appended,
                    "fault-in count mismatch"
                );
            }
            if appended > remaining {
                for page in set.pages.drain(before + remaining..) {
                    self.mem.drop_reference(page);
                }
            }
            let got = appended.min(remaining);
            if got == 0 {
                tracing::debug!(pid = %ctx.pid(), addr = cur, "fault-in made no progress");
                return Err(MemError::InvalidAddress { addr: cur });
            }
            cur += got as u64 * page::PAGE_SIZE;
            remaining -= got;
        }

        tracing::trace!(pid = %ctx.pid(), virt_addr, length, npages, "pinned user range");
        Ok(set)
    }

    /// Unpin a set. Equivalent to dropping it.
    pub fn release(&self, set: PinnedPageSet) {
        drop(set);
    }
}
