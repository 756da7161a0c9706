//! Per-block free-space hints.
//!
//! A chunk's allocation map is cut into `PCPU_BITMAP_BLOCK_BITS` slices, one
//! per page. Each slice carries a [`BlockMd`] summary that is kept exact
//! incrementally on alloc and free, falling back to [`BlockMd::refresh`] when
//! an allocation lands inside the recorded hint.

use crate::bitmap::Bitmap;
use crate::mm_constants::PCPU_BITMAP_BLOCK_BITS;

const BLOCK: usize = PCPU_BITMAP_BLOCK_BITS;

/// Free-space summary of one metadata block, in allocation units relative
/// to the block start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMd {
    pub contig_hint: usize,
    /// Start of the `contig_hint` run; meaningless while `contig_hint == 0`.
    pub contig_hint_start: usize,
    pub left_free: usize,
    pub right_free: usize,
    /// First free unit, `PCPU_BITMAP_BLOCK_BITS` when the block is full.
    pub first_free: usize,
}

impl BlockMd {
    pub const fn free() -> Self {
        Self {
            contig_hint: BLOCK,
            contig_hint_start: 0,
            left_free: BLOCK,
            right_free: BLOCK,
            first_free: 0,
        }
    }

    pub const fn full() -> Self {
        Self {
            contig_hint: 0,
            contig_hint_start: 0,
            left_free: 0,
            right_free: 0,
            first_free: BLOCK,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.contig_hint == BLOCK
    }

    #[inline]
    fn hint_contains(&self, off: usize) -> bool {
        self.contig_hint != 0
            && off >= self.contig_hint_start
            && off < self.contig_hint_start + self.contig_hint
    }

    /// Rescan the block's slice of `map` starting at `first_free`.
    pub fn refresh(&mut self, map: &Bitmap, index: usize) {
        let base = index * BLOCK;
        let limit = base + BLOCK;
        let mut left_free = 0;
        let mut right_free = 0;

        self.contig_hint = 0;
        let mut start = base + self.first_free;
        while start < limit {
            start = map.find_next_zero_bit(start, limit);
            if start >= limit {
                break;
            }
            let end = map.find_next_bit(start, limit);
            let contig = end - start;
            if start == base {
                left_free = contig;
            }
            if end == limit {
                right_free = contig;
            }
            if self.contig_hint < contig {
                self.contig_hint = contig;
                self.contig_hint_start = start - base;
            }
            start = end;
        }

        self.left_free = left_free;
        self.right_free = right_free;
    }
}

/// Blocks touched by the bit range `[bit_off, bit_off + bit_size)`.
///
/// `e_off` is exclusive and in `1..=BLOCK`, so a range ending exactly on a
/// block boundary belongs to the block before it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockSpan {
    pub s_index: usize,
    pub e_index: usize,
    pub s_off: usize,
    pub e_off: usize,
}

impl BlockSpan {
    pub fn new(bit_off: usize, bit_size: usize) -> Self {
        let end = bit_off + bit_size;
        let (mut e_index, mut e_off) = (end / BLOCK, end % BLOCK);
        if e_off == 0 {
            e_off = BLOCK;
            e_index -= 1;
        }
        Self {
            s_index: bit_off / BLOCK,
            e_index,
            s_off: bit_off % BLOCK,
            e_off,
        }
    }
}

/// Bring the block hints up to date after `[bit_off, bit_off + bit_size)`
/// was marked allocated in `map`.
pub(crate) fn update_on_alloc(blocks: &mut [BlockMd], map: &Bitmap, bit_off: usize, bit_size: usize) {
    let span = BlockSpan::new(bit_off, bit_size);
    let s_base = span.s_index * BLOCK;

    let s_block = &mut blocks[span.s_index];
    if span.s_off == s_block.first_free {
        s_block.first_free =
            (map.find_next_zero_bit(bit_off + bit_size, s_base + BLOCK) - s_base).min(BLOCK);
    }

    if s_block.hint_contains(span.s_off) {
        s_block.refresh(map, span.s_index);
    } else {
        // The broken run is not the hint; only the edges can shrink.
        s_block.left_free = s_block.left_free.min(span.s_off);
        if span.s_index == span.e_index {
            s_block.right_free = s_block.right_free.min(BLOCK - span.e_off);
        } else {
            s_block.right_free = 0;
        }
    }

    if span.s_index != span.e_index {
        let e_base = span.e_index * BLOCK;
        let e_block = &mut blocks[span.e_index];
        e_block.first_free = map.find_next_zero_bit(e_base + span.e_off, e_base + BLOCK) - e_base;
        e_block.refresh(map, span.e_index);
    }

    if span.e_index > span.s_index + 1 {
        for block in &mut blocks[span.s_index + 1..span.e_index] {
            *block = BlockMd::full();
        }
    }
}

/// Outcome of [`update_on_free`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum FreeHint {
    /// The freed run reaches a block edge or crosses blocks and may merge
    /// with neighbours; the chunk hint needs a full aggregation pass.
    Rescan,
    /// The freed run is interior to block `index`; promoting that block's
    /// hint into the chunk hint is enough.
    Promote { index: usize },
}

/// Bring the block hints up to date after `[bit_off, bit_off + bit_size)`
/// was cleared in `map`.
pub(crate) fn update_on_free(
    blocks: &mut [BlockMd],
    map: &Bitmap,
    bit_off: usize,
    bit_size: usize,
) -> FreeHint {
    let span = BlockSpan::new(bit_off, bit_size);
    let s_base = span.s_index * BLOCK;
    let e_base = span.e_index * BLOCK;

    // Widen the freed range to the whole free run inside the edge blocks,
    // borrowing the old hint when the range abuts it.
    let s_block = blocks[span.s_index];
    let start = if s_block.contig_hint != 0
        && span.s_off == s_block.contig_hint_start + s_block.contig_hint
    {
        s_block.contig_hint_start
    } else {
        match map.find_last_bit(s_base, s_base + span.s_off) {
            Some(bit) => bit + 1 - s_base,
            None => 0,
        }
    };

    let e_block = blocks[span.e_index];
    let end = if e_block.contig_hint != 0 && span.e_off == e_block.contig_hint_start {
        e_block.contig_hint_start + e_block.contig_hint
    } else {
        map.find_next_bit(e_base + span.e_off, e_base + BLOCK) - e_base
    };

    if span.s_index == span.e_index {
        let block = &mut blocks[span.s_index];
        let contig = end - start;
        if start == 0 {
            block.left_free = contig;
        }
        if end == BLOCK {
            block.right_free = contig;
        }
        block.first_free = block.first_free.min(start);
        if contig > block.contig_hint {
            block.contig_hint = contig;
            block.contig_hint_start = start;
        }

        if start == 0 || end == BLOCK {
            return FreeHint::Rescan;
        }
        return FreeHint::Promote {
            index: span.s_index,
        };
    }

    // Edge blocks made entirely free are reset together with the interior.
    let reset_from = if start == 0 {
        span.s_index
    } else {
        let block = &mut blocks[span.s_index];
        let contig = BLOCK - start;
        block.first_free = block.first_free.min(start);
        block.right_free = contig;
        if contig > block.contig_hint {
            block.contig_hint = contig;
            block.contig_hint_start = start;
        }
        span.s_index + 1
    };

    let reset_to = if end == BLOCK {
        span.e_index + 1
    } else {
        let block = &mut blocks[span.e_index];
        block.first_free = 0;
        block.left_free = end;
        if end > block.contig_hint {
            block.contig_hint = end;
            block.contig_hint_start = 0;
        }
        span.e_index
    };

    for block in &mut blocks[reset_from..reset_to] {
        *block = BlockMd::free();
    }

    FreeHint::Rescan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(allocated: &[(usize, usize)], nbits: usize) -> Bitmap {
        let mut map = Bitmap::new(nbits);
        for &(start, len) in allocated {
            map.set_range(start, len);
        }
        map
    }

    #[test]
    fn test_refresh_scans_runs() {
        let map = map_with(&[(0, 10), (100, 1), (1000, 24)], BLOCK);
        let mut block = BlockMd::free();
        block.first_free = 10;
        block.refresh(&map, 0);

        assert_eq!(block.left_free, 0);
        assert_eq!(block.right_free, 0);
        assert_eq!(block.contig_hint, 899);
        assert_eq!(block.contig_hint_start, 101);
    }

    #[test]
    fn test_span_end_on_boundary() {
        let span = BlockSpan::new(1000, 24);
        assert_eq!((span.s_index, span.e_index), (0, 0));
        assert_eq!((span.s_off, span.e_off), (1000, BLOCK));

        let span = BlockSpan::new(1000, 2000);
        assert_eq!((span.s_index, span.e_index), (0, 2));
        assert_eq!(span.e_off, 3000 - 2 * BLOCK);
    }

    #[test]
    fn test_alloc_spanning_blocks_clears_interior() {
        let mut map = Bitmap::new(3 * BLOCK);
        let mut blocks = [BlockMd::free(); 3];
        map.set_range(1000, 1100);
        update_on_alloc(&mut blocks, &map, 1000, 1100);

        assert_eq!(blocks[0].left_free, 1000);
        assert_eq!(blocks[0].right_free, 0);
        assert_eq!(blocks[0].contig_hint, 1000);
        assert_eq!(blocks[1], BlockMd::full());
        assert_eq!(blocks[2].first_free, 2100 - 2 * BLOCK);
        assert_eq!(blocks[2].left_free, 0);
        assert_eq!(blocks[2].right_free, 3 * BLOCK - 2100);
        assert_eq!(blocks[2].contig_hint, 3 * BLOCK - 2100);
        assert_eq!(blocks[2].contig_hint_start, 2100 - 2 * BLOCK);
    }

    #[test]
    fn test_alloc_inside_one_block() {
        let mut map = Bitmap::new(2 * BLOCK);
        let mut blocks = [BlockMd::free(); 2];

        map.set_range(0, 3);
        update_on_alloc(&mut blocks, &map, 0, 3);
        assert_eq!(blocks[0].first_free, 3);
        assert_eq!((blocks[0].left_free, blocks[0].right_free), (0, BLOCK - 3));
        assert_eq!((blocks[0].contig_hint, blocks[0].contig_hint_start), (BLOCK - 3, 3));
        assert!(blocks[1].is_free());

        // Last block of the map.
        map.set_range(BLOCK + 10, 5);
        update_on_alloc(&mut blocks, &map, BLOCK + 10, 5);
        assert_eq!(blocks[1].first_free, 0);
        assert_eq!((blocks[1].left_free, blocks[1].right_free), (10, BLOCK - 15));
        assert_eq!((blocks[1].contig_hint, blocks[1].contig_hint_start), (BLOCK - 15, 15));
        assert_eq!(blocks[0].contig_hint, BLOCK - 3);
    }

    #[test]
    fn test_free_merges_with_hint() {
        let mut map = map_with(&[(0, 20), (40, 984)], BLOCK);
        let mut blocks = [BlockMd::free()];
        blocks[0].first_free = 20;
        blocks[0].refresh(&map, 0);
        assert_eq!((blocks[0].contig_hint, blocks[0].contig_hint_start), (20, 20));

        map.clear_range(40, 10);
        let hint = update_on_free(&mut blocks, &map, 40, 10);
        assert!(matches!(hint, FreeHint::Promote { index: 0 }));
        assert_eq!((blocks[0].contig_hint, blocks[0].contig_hint_start), (30, 20));
        assert_eq!(blocks[0].first_free, 20);
    }
}
