//! Page arithmetic on 64-bit virtual addresses.

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

#[inline]
pub const fn align_down(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Round up to the next page boundary; `None` if that wraps.
#[inline]
pub const fn align_up(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & PAGE_MASK),
        None => None,
    }
}

#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// True when `addr + len` wraps, or rounding its end up to a page does.
pub fn range_overflows(addr: u64, len: u64) -> bool {
    match addr.checked_add(len) {
        Some(end) => align_up(end).is_none(),
        None => true,
    }
}

/// Number of pages touched by `[addr, addr + len)`. Zero for an empty range.
///
/// Callers must check [`range_overflows`] first.
pub fn npages(addr: u64, len: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    let end = align_up(addr + len).unwrap_or(u64::MAX & PAGE_MASK);
    (end - align_down(addr)) >> PAGE_SHIFT
}
