use alloc::vec;
use alloc::vec::Vec;

use pcpu_lib::{align_up, pfn_down, pfn_up};

use super::block::{self, BlockMd, BlockSpan, FreeHint};
use super::slots::ChunkLink;
use crate::bitmap::Bitmap;
use crate::mm_constants::{PAGE_SHIFT, PCPU_BITMAP_BLOCK_BITS, PCPU_MIN_ALLOC_SIZE, pages_to_bits};

const BLOCK: usize = PCPU_BITMAP_BLOCK_BITS;

/// One allocation domain: `nr_pages` pages per unit, tracked as
/// `PCPU_MIN_ALLOC_SIZE`-byte allocation units.
///
/// All offsets handed in and out of the area functions are byte offsets
/// from `base_addr`; everything else is in allocation units. Page `i` of the
/// chunk is covered by metadata block `i`.
pub struct Chunk {
    base_addr: usize,
    nr_pages: usize,
    alloc_map: Bitmap,
    /// `nr_bits + 1` bits; set at the first unit and one past the last unit
    /// of every live area.
    bound_map: Bitmap,
    populated: Bitmap,
    md_blocks: Vec<BlockMd>,
    free_bits: usize,
    contig_hint: usize,
    contig_hint_start: usize,
    first_free_block: usize,
    immutable: bool,
    has_reserved: bool,
    nr_populated: usize,
    nr_empty_pop_pages: usize,
    pub(crate) link: ChunkLink,
}

impl Chunk {
    /// A dynamic chunk: entirely free, nothing populated.
    pub fn new(base_addr: usize, nr_pages: usize) -> Self {
        let nr_bits = pages_to_bits(nr_pages);
        Self {
            base_addr,
            nr_pages,
            alloc_map: Bitmap::new(nr_bits),
            bound_map: Bitmap::new(nr_bits + 1),
            populated: Bitmap::new(nr_pages),
            md_blocks: vec![BlockMd::free(); nr_pages],
            free_bits: nr_bits,
            contig_hint: nr_bits,
            contig_hint_start: 0,
            first_free_block: 0,
            immutable: false,
            has_reserved: false,
            nr_populated: 0,
            nr_empty_pop_pages: 0,
            link: ChunkLink::default(),
        }
    }

    /// A chunk carved from the pre-mapped boot area: immutable and fully
    /// populated.
    pub fn new_first(base_addr: usize, nr_pages: usize) -> Self {
        let mut chunk = Self::new(base_addr, nr_pages);
        chunk.immutable = true;
        chunk.populated.fill();
        chunk.nr_populated = nr_pages;
        chunk.nr_empty_pop_pages = nr_pages;
        chunk
    }

    /// Mark the first `bits` units as one pre-allocated area.
    ///
    /// Used when the chunk base was pulled down to a page boundary inside the
    /// static area; the overlap must never be handed out.
    pub fn hide_prefix(&mut self, bits: usize) {
        if bits == 0 {
            return;
        }
        self.has_reserved = true;
        self.commit_area(0, bits);
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base_addr
    }

    #[inline]
    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    #[inline]
    pub fn nr_bits(&self) -> usize {
        self.alloc_map.len()
    }

    #[inline]
    pub fn free_bits(&self) -> usize {
        self.free_bits
    }

    #[inline]
    pub fn contig_hint(&self) -> usize {
        self.contig_hint
    }

    #[inline]
    pub fn contig_hint_start(&self) -> usize {
        self.contig_hint_start
    }

    #[inline]
    pub fn first_free_block(&self) -> usize {
        self.first_free_block
    }

    #[inline]
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    #[inline]
    pub fn has_reserved(&self) -> bool {
        self.has_reserved
    }

    #[inline]
    pub fn nr_populated(&self) -> usize {
        self.nr_populated
    }

    #[inline]
    pub fn nr_empty_pop_pages(&self) -> usize {
        self.nr_empty_pop_pages
    }

    pub fn alloc_map(&self) -> &Bitmap {
        &self.alloc_map
    }

    pub fn bound_map(&self) -> &Bitmap {
        &self.bound_map
    }

    pub fn populated(&self) -> &Bitmap {
        &self.populated
    }

    pub fn blocks(&self) -> &[BlockMd] {
        &self.md_blocks
    }

    /// Whether `addr` falls inside unit 0's span of this chunk.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr && addr < self.base_addr + (self.nr_pages << PAGE_SHIFT)
    }

    /// Whether a live area starts at byte offset `off`.
    pub fn is_area_start(&self, off: usize) -> bool {
        if off % PCPU_MIN_ALLOC_SIZE != 0 {
            return false;
        }
        let bit_off = off / PCPU_MIN_ALLOC_SIZE;
        bit_off < self.nr_bits() && self.alloc_map.test(bit_off) && self.bound_map.test(bit_off)
    }

    fn count_empty_pop_pages(&self, from: usize, to: usize) -> usize {
        (from..to)
            .filter(|&page| self.populated.test(page) && self.md_blocks[page].is_free())
            .count()
    }

    /// Re-aggregate `contig_hint` from the block hints and recount the
    /// empty populated pages.
    fn update_hint(&mut self) {
        let mut contig_hint = 0;
        let mut contig_hint_start = 0;
        let mut cur_contig = 0;
        let mut off = 0;

        for (i, block) in self.md_blocks.iter().enumerate().skip(self.first_free_block) {
            if cur_contig != 0 {
                cur_contig += block.left_free;
                if block.left_free == BLOCK {
                    continue;
                }
                if cur_contig > contig_hint {
                    contig_hint = cur_contig;
                    contig_hint_start = off;
                }
                cur_contig = 0;
            }
            if block.contig_hint > contig_hint {
                contig_hint = block.contig_hint;
                contig_hint_start = i * BLOCK + block.contig_hint_start;
            }
            cur_contig = block.right_free;
            off = (i + 1) * BLOCK - block.right_free;
        }

        if cur_contig > contig_hint {
            contig_hint = cur_contig;
            contig_hint_start = off;
        }

        self.contig_hint = contig_hint;
        self.contig_hint_start = contig_hint_start;
        self.nr_empty_pop_pages = self.count_empty_pop_pages(0, self.nr_pages);
    }

    /// `Err(next_block)` when part of the candidate's pages are unpopulated;
    /// the search resumes at the first populated page after the hole.
    fn check_populated(&self, index: usize, block_off: usize, bit_size: usize) -> Result<(), usize> {
        let off = (index * BLOCK + block_off) * PCPU_MIN_ALLOC_SIZE;
        let e_off = off + bit_size * PCPU_MIN_ALLOC_SIZE;
        let page_start = pfn_down(off, PAGE_SHIFT);
        let page_end = pfn_up(e_off, PAGE_SHIFT).min(self.nr_pages);

        match self.populated.next_zero_region(page_start, page_end) {
            None => Ok(()),
            Some((_, re)) => Err(re),
        }
    }

    /// Pick the unit offset at which [`Chunk::alloc_area`] should start its
    /// exact search, trusting the block hints.
    ///
    /// Each block is tried three ways: the free run carried over from earlier
    /// blocks plus its `left_free`, its aligned `contig_hint`, and its aligned
    /// `right_free` as the start of a run into the next block. With
    /// `pop_only`, candidates touching an unpopulated page are skipped.
    pub fn find_block_fit(&self, bit_size: usize, bit_align: usize, pop_only: bool) -> Option<usize> {
        let nr_blocks = self.md_blocks.len();
        let mut cur_free = 0;
        let mut block_off = 0;
        let mut s_index = self.first_free_block;
        let mut i = self.first_free_block;

        while i < nr_blocks {
            let block = &self.md_blocks[i];
            let end_off;

            cur_free += block.left_free;
            if cur_free >= bit_size {
                end_off = bit_size;
            } else if block.left_free == BLOCK {
                i += 1;
                continue;
            } else {
                cur_free = 0;
                s_index = i;

                let hint_off = align_up(block.contig_hint_start, bit_align);
                if block.contig_hint != 0
                    && block.contig_hint >= hint_off - block.contig_hint_start + bit_size
                {
                    // The hint guarantees a fit, but an earlier hole may
                    // also do; let the exact search start at first_free.
                    block_off = block.first_free;
                    end_off = hint_off - block_off + bit_size;
                } else {
                    block_off = align_up(BLOCK - block.right_free, bit_align);
                    if block_off >= BLOCK {
                        s_index += 1;
                        cur_free = 0;
                        block_off = 0;
                        i += 1;
                        continue;
                    }
                    cur_free = BLOCK - block_off;
                    if cur_free < bit_size {
                        i += 1;
                        continue;
                    }
                    end_off = bit_size;
                }
            }

            if !pop_only {
                return Some(s_index * BLOCK + block_off);
            }
            match self.check_populated(s_index, block_off, end_off) {
                Ok(()) => return Some(s_index * BLOCK + block_off),
                Err(next) => {
                    i = next;
                    s_index = next;
                    cur_free = 0;
                    block_off = 0;
                }
            }
        }

        None
    }

    /// Mark `[bit_off, bit_off + bit_size)` allocated and bring every hint
    /// and counter up to date.
    fn commit_area(&mut self, bit_off: usize, bit_size: usize) {
        let span = BlockSpan::new(bit_off, bit_size);
        let empty_before = self.count_empty_pop_pages(span.s_index, span.e_index + 1);

        self.alloc_map.set_range(bit_off, bit_size);
        self.bound_map.set(bit_off);
        self.bound_map.clear_range(bit_off + 1, bit_size - 1);
        self.bound_map.set(bit_off + bit_size);
        self.free_bits -= bit_size;

        let breaks_hint = bit_off >= self.contig_hint_start
            && bit_off < self.contig_hint_start + self.contig_hint;

        block::update_on_alloc(&mut self.md_blocks, &self.alloc_map, bit_off, bit_size);

        let empty_after = self.count_empty_pop_pages(span.s_index, span.e_index + 1);
        self.nr_empty_pop_pages = self.nr_empty_pop_pages + empty_after - empty_before;

        if breaks_hint {
            self.update_hint();
        }

        while self.first_free_block < self.md_blocks.len()
            && self.md_blocks[self.first_free_block].contig_hint == 0
        {
            self.first_free_block += 1;
        }
    }

    /// Allocate `bit_size` units aligned to `bit_align` units, searching from
    /// unit `start`. Returns the byte offset of the area.
    ///
    /// This is the authoritative search; it may fail even though
    /// [`Chunk::find_block_fit`] proposed `start`.
    pub fn alloc_area(&mut self, bit_size: usize, bit_align: usize, start: usize) -> Option<usize> {
        let bit_off = self.find_area(bit_size, bit_align, start)?;
        self.commit_area(bit_off, bit_size);
        Some(bit_off * PCPU_MIN_ALLOC_SIZE)
    }

    /// [`Chunk::alloc_area`] for callers that cannot populate: the area
    /// found must already be fully backed, otherwise nothing is committed.
    pub fn alloc_area_populated(
        &mut self,
        bit_size: usize,
        bit_align: usize,
        start: usize,
    ) -> Option<usize> {
        let bit_off = self.find_area(bit_size, bit_align, start)?;
        let off = bit_off * PCPU_MIN_ALLOC_SIZE;
        if !self.is_area_populated(off, bit_size * PCPU_MIN_ALLOC_SIZE) {
            return None;
        }
        self.commit_area(bit_off, bit_size);
        Some(off)
    }

    fn find_area(&self, bit_size: usize, bit_align: usize, start: usize) -> Option<usize> {
        let align_mask = bit_align.max(1) - 1;
        self.alloc_map
            .find_next_zero_area(start, bit_size, align_mask)
    }

    /// Free the area starting at byte offset `off`, recovering its size from
    /// the boundary map. Returns the number of units freed.
    pub fn free_area(&mut self, off: usize) -> usize {
        let nr_bits = self.nr_bits();
        let bit_off = off / PCPU_MIN_ALLOC_SIZE;
        let end = self.bound_map.find_next_bit(bit_off + 1, nr_bits + 1);
        let bit_size = end - bit_off;

        let span = BlockSpan::new(bit_off, bit_size);
        let empty_before = self.count_empty_pop_pages(span.s_index, span.e_index + 1);

        self.alloc_map.clear_range(bit_off, bit_size);
        // Boundary bits shared with an adjacent live area stay set.
        if bit_off == 0 || !self.alloc_map.test(bit_off - 1) {
            self.bound_map.clear(bit_off);
        }
        if end == nr_bits || !self.alloc_map.test(end) {
            self.bound_map.clear(end);
        }
        self.free_bits += bit_size;
        self.first_free_block = self.first_free_block.min(span.s_index);

        let hint = block::update_on_free(&mut self.md_blocks, &self.alloc_map, bit_off, bit_size);

        let empty_after = self.count_empty_pop_pages(span.s_index, span.e_index + 1);
        self.nr_empty_pop_pages = self.nr_empty_pop_pages + empty_after - empty_before;

        match hint {
            FreeHint::Rescan => self.update_hint(),
            FreeHint::Promote { index } => {
                let block = &self.md_blocks[index];
                if block.contig_hint > self.contig_hint {
                    self.contig_hint = block.contig_hint;
                    self.contig_hint_start = index * BLOCK + block.contig_hint_start;
                }
            }
        }

        bit_size
    }

    /// Whether every page under the byte range `[off, off + size)` is
    /// populated.
    pub fn is_area_populated(&self, off: usize, size: usize) -> bool {
        let page_start = pfn_down(off, PAGE_SHIFT);
        let page_end = pfn_up(off + size, PAGE_SHIFT).min(self.nr_pages);
        self.populated.next_zero_region(page_start, page_end).is_none()
    }

    /// Unpopulated page runs inside `[page_start, page_end)`.
    pub fn unpopulated_regions(&self, page_start: usize, page_end: usize) -> Vec<(usize, usize)> {
        self.populated.zero_regions(page_start, page_end)
    }

    /// Populated page runs inside `[page_start, page_end)`.
    pub fn populated_regions(&self, page_start: usize, page_end: usize) -> Vec<(usize, usize)> {
        self.populated.set_regions(page_start, page_end)
    }

    /// Bookkeeping after pages `[page_start, page_end)` gained backing.
    pub fn mark_populated(&mut self, page_start: usize, page_end: usize) {
        self.populated.set_range(page_start, page_end - page_start);
        self.nr_populated += page_end - page_start;
        self.nr_empty_pop_pages += self.count_empty_pop_pages(page_start, page_end);
    }

    /// Bookkeeping after pages `[page_start, page_end)` lost their backing.
    pub fn mark_depopulated(&mut self, page_start: usize, page_end: usize) {
        let empty = self.count_empty_pop_pages(page_start, page_end);
        self.populated.clear_range(page_start, page_end - page_start);
        self.nr_populated -= page_end - page_start;
        self.nr_empty_pop_pages -= empty;
    }
}

impl core::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Chunk")
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .field("nr_pages", &self.nr_pages)
            .field("free_bits", &self.free_bits)
            .field("contig_hint", &self.contig_hint)
            .field("contig_hint_start", &self.contig_hint_start)
            .field("nr_populated", &self.nr_populated)
            .field("nr_empty_pop_pages", &self.nr_empty_pop_pages)
            .field("immutable", &self.immutable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm_constants::PAGE_SIZE;

    #[test]
    fn test_hidden_prefix_is_allocated() {
        let mut chunk = Chunk::new_first(0x10000, 4);
        chunk.hide_prefix(100);

        assert!(chunk.has_reserved());
        assert_eq!(chunk.free_bits(), 4 * BLOCK - 100);
        assert_eq!(chunk.contig_hint(), 4 * BLOCK - 100);
        assert_eq!(chunk.contig_hint_start(), 100);
        assert!(chunk.is_area_start(0));
        assert!(chunk.bound_map().test(100));
        // Page 0 now holds the prefix, the other three are still empty.
        assert_eq!(chunk.nr_empty_pop_pages(), 3);
    }

    #[test]
    fn test_block_fit_skips_unpopulated_pages() {
        let mut chunk = Chunk::new(0x10000, 4);
        chunk.mark_populated(2, 4);
        assert_eq!(chunk.nr_empty_pop_pages(), 2);

        assert_eq!(chunk.find_block_fit(16, 1, false), Some(0));
        assert_eq!(chunk.find_block_fit(16, 1, true), Some(2 * BLOCK));
        assert_eq!(chunk.find_block_fit(3 * BLOCK, 1, true), None);

        let off = chunk.alloc_area(16, 1, 2 * BLOCK).unwrap();
        assert_eq!(off, 2 * PAGE_SIZE);
        assert!(chunk.is_area_populated(off, 16 * PCPU_MIN_ALLOC_SIZE));
        assert_eq!(chunk.nr_empty_pop_pages(), 1);
    }

    #[test]
    fn test_small_alloc_in_single_page_chunk() {
        let mut chunk = Chunk::new(0x10000, 1);
        chunk.mark_populated(0, 1);
        assert_eq!(chunk.nr_empty_pop_pages(), 1);

        assert_eq!(chunk.alloc_area(3, 1, 0), Some(0));
        assert_eq!(chunk.free_bits(), BLOCK - 3);
        assert_eq!((chunk.contig_hint(), chunk.contig_hint_start()), (BLOCK - 3, 3));
        assert_eq!(chunk.nr_empty_pop_pages(), 0);

        assert_eq!(chunk.free_area(0), 3);
        assert_eq!(chunk.free_bits(), BLOCK);
        assert_eq!(chunk.contig_hint(), BLOCK);
        assert_eq!(chunk.nr_empty_pop_pages(), 1);
    }

    #[test]
    fn test_shared_boundary_survives_neighbour_free() {
        let mut chunk = Chunk::new(0x10000, 1);
        let a = chunk.alloc_area(3, 1, 0).unwrap();
        let b = chunk.alloc_area(5, 1, 0).unwrap();
        assert_eq!((a, b), (0, 3 * PCPU_MIN_ALLOC_SIZE));

        assert_eq!(chunk.free_area(a), 3);
        assert!(!chunk.bound_map().test(0));
        assert!(chunk.bound_map().test(3));
        assert!(chunk.bound_map().test(8));
        assert_eq!(chunk.free_area(b), 5);
        assert_eq!(chunk.bound_map().weight(0, chunk.nr_bits() + 1), 0);
    }
}
