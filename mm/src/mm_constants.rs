//! Per-CPU allocator constants.
//!
//! Sizes are in bytes unless the name says `BITS`; one allocation unit is
//! `PCPU_MIN_ALLOC_SIZE` bytes and is tracked by one bitmap bit.

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const PCPU_MIN_ALLOC_SHIFT: u32 = 2;
pub const PCPU_MIN_ALLOC_SIZE: usize = 1 << PCPU_MIN_ALLOC_SHIFT;

/// Allocation units covered by one metadata block.
pub const PCPU_BITMAP_BLOCK_BITS: usize = PAGE_SIZE >> PCPU_MIN_ALLOC_SHIFT;

// Page accounting maps every page onto exactly one metadata block.
const _: () = assert!(PCPU_BITMAP_BLOCK_BITS * PCPU_MIN_ALLOC_SIZE == PAGE_SIZE);

pub const PCPU_SLOT_BASE_SHIFT: u32 = 3;

/// Balance work is scheduled when fewer empty populated pages remain.
pub const PCPU_EMPTY_POP_PAGES_LOW: usize = 2;
/// Pre-population target of the balance work.
pub const PCPU_EMPTY_POP_PAGES_HIGH: usize = 4;

pub const PCPU_MIN_UNIT_SIZE: usize = 32 << 10;
pub const PERCPU_DYNAMIC_EARLY_SIZE: usize = 12 << 10;

/// Blocking allocation failures reported before the warning goes quiet.
pub const PCPU_WARN_LIMIT: u32 = 10;

#[inline(always)]
pub const fn pages_to_bits(pages: usize) -> usize {
    pages * PCPU_BITMAP_BLOCK_BITS
}
