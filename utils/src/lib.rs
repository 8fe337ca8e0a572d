#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

pub mod fs;

/// Round `addr` down to the closest multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
#[must_use]
pub fn round_down(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Round `value` up to the closest multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
#[must_use]
pub fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Iterate over the start addresses of all `page_size` pages that
/// overlap `[start, start + len)`.
pub fn pages(start: u64, len: u64, page_size: u64) -> impl Iterator<Item = u64> {
    let first = round_down(start, page_size);
    let end = start + len;
    (0..)
        .map(move |i| first + i * page_size)
        .take_while(move |page| *page < end)
}
