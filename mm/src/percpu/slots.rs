//! Chunk arena and capacity-bucketed slot lists.
//!
//! Chunks live in an index arena and are linked into per-slot intrusive
//! lists through [`ChunkLink`]. Slot 0 holds full chunks, the top slot holds
//! entirely free ones; in between, a chunk's slot grows with the log of its
//! free space.

use alloc::vec;
use alloc::vec::Vec;

use pcpu_lib::fls;

use super::chunk::Chunk;
use crate::mm_constants::PCPU_SLOT_BASE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(usize);

/// Position of a chunk inside its slot list; `slot == None` when unlisted.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChunkLink {
    slot: Option<usize>,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
}

/// Slot for a free run or free total of `bits` units, ignoring the top slot.
#[inline]
pub(crate) fn raw_size_to_slot(bits: usize) -> usize {
    let highbit = fls(bits) as usize;
    (highbit + 2).saturating_sub(PCPU_SLOT_BASE_SHIFT as usize).max(1)
}

pub struct ChunkTable {
    entries: Vec<Option<Chunk>>,
    free_ids: Vec<usize>,
    heads: Vec<Option<ChunkId>>,
    tails: Vec<Option<ChunkId>>,
    /// Units in a full-size chunk; a chunk with this many free units is
    /// entirely free.
    unit_bits: usize,
    live: usize,
}

impl ChunkTable {
    pub fn new(unit_bits: usize) -> Self {
        let nr_slots = raw_size_to_slot(unit_bits) + 2;
        Self {
            entries: Vec::new(),
            free_ids: Vec::new(),
            heads: vec![None; nr_slots],
            tails: vec![None; nr_slots],
            unit_bits,
            live: 0,
        }
    }

    #[inline]
    pub fn nr_slots(&self) -> usize {
        self.heads.len()
    }

    #[inline]
    pub fn top_slot(&self) -> usize {
        self.nr_slots() - 1
    }

    #[inline]
    pub fn unit_bits(&self) -> usize {
        self.unit_bits
    }

    /// Number of chunks in the arena, listed or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn size_to_slot(&self, bits: usize) -> usize {
        if bits == self.unit_bits {
            return self.top_slot();
        }
        raw_size_to_slot(bits)
    }

    pub fn chunk_slot(&self, chunk: &Chunk) -> usize {
        if chunk.free_bits() == 0 || chunk.contig_hint() == 0 {
            return 0;
        }
        self.size_to_slot(chunk.free_bits())
    }

    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        self.live += 1;
        match self.free_ids.pop() {
            Some(index) => {
                self.entries[index] = Some(chunk);
                ChunkId(index)
            }
            None => {
                self.entries.push(Some(chunk));
                ChunkId(self.entries.len() - 1)
            }
        }
    }

    /// Unlink and drop `id` from the arena, handing the chunk back.
    pub fn remove(&mut self, id: ChunkId) -> Option<Chunk> {
        self.unlink(id);
        let chunk = self.entries.get_mut(id.0)?.take()?;
        self.free_ids.push(id.0);
        self.live -= 1;
        Some(chunk)
    }

    #[inline]
    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.entries.get(id.0)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.entries.get_mut(id.0)?.as_mut()
    }

    pub fn ids(&self) -> Vec<ChunkId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_some())
            .map(|(index, _)| ChunkId(index))
            .collect()
    }

    pub fn is_listed(&self, id: ChunkId) -> bool {
        self.get(id).is_some_and(|chunk| chunk.link.slot.is_some())
    }

    pub fn slot_of(&self, id: ChunkId) -> Option<usize> {
        self.get(id).and_then(|chunk| chunk.link.slot)
    }

    pub fn slot_is_empty(&self, slot: usize) -> bool {
        self.heads[slot].is_none()
    }

    /// Snapshot of the chunks in `slot`, head first.
    pub fn slot_ids(&self, slot: usize) -> Vec<ChunkId> {
        let mut ids = Vec::new();
        let mut cursor = self.heads[slot];
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.get(id).and_then(|chunk| chunk.link.next);
        }
        ids
    }

    fn link_mut(&mut self, id: ChunkId) -> Option<&mut ChunkLink> {
        self.get_mut(id).map(|chunk| &mut chunk.link)
    }

    fn unlink(&mut self, id: ChunkId) {
        let Some(link) = self.get(id).map(|chunk| chunk.link) else {
            return;
        };
        let Some(slot) = link.slot else {
            return;
        };

        match link.prev {
            Some(prev) => {
                if let Some(prev_link) = self.link_mut(prev) {
                    prev_link.next = link.next;
                }
            }
            None => self.heads[slot] = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(next_link) = self.link_mut(next) {
                    next_link.prev = link.prev;
                }
            }
            None => self.tails[slot] = link.prev,
        }

        if let Some(own) = self.link_mut(id) {
            *own = ChunkLink::default();
        }
    }

    fn push_head(&mut self, id: ChunkId, slot: usize) {
        let old_head = self.heads[slot];
        if let Some(own) = self.link_mut(id) {
            *own = ChunkLink {
                slot: Some(slot),
                prev: None,
                next: old_head,
            };
        }
        match old_head {
            Some(head) => {
                if let Some(head_link) = self.link_mut(head) {
                    head_link.prev = Some(id);
                }
            }
            None => self.tails[slot] = Some(id),
        }
        self.heads[slot] = Some(id);
    }

    fn push_tail(&mut self, id: ChunkId, slot: usize) {
        let old_tail = self.tails[slot];
        if let Some(own) = self.link_mut(id) {
            *own = ChunkLink {
                slot: Some(slot),
                prev: old_tail,
                next: None,
            };
        }
        match old_tail {
            Some(tail) => {
                if let Some(tail_link) = self.link_mut(tail) {
                    tail_link.next = Some(id);
                }
            }
            None => self.heads[slot] = Some(id),
        }
        self.tails[slot] = Some(id);
    }

    /// Put a chunk that is not yet listed at the tail of its slot.
    pub fn link_new(&mut self, id: ChunkId) {
        let Some(chunk) = self.get(id) else {
            return;
        };
        if chunk.link.slot.is_some() {
            return;
        }
        let slot = self.chunk_slot(chunk);
        self.push_tail(id, slot);
    }

    /// Move a listed chunk to the slot matching its current free space.
    ///
    /// A chunk that gained free space goes to the tail of its new list, one
    /// that lost free space to the head, so allocations keep draining the
    /// fullest chunks first. Unlisted chunks are left alone.
    pub fn relocate(&mut self, id: ChunkId) {
        let Some(chunk) = self.get(id) else {
            return;
        };
        let Some(old_slot) = chunk.link.slot else {
            return;
        };
        let new_slot = self.chunk_slot(chunk);
        if old_slot == new_slot {
            return;
        }
        self.unlink(id);
        if new_slot > old_slot {
            self.push_tail(id, new_slot);
        } else {
            self.push_head(id, new_slot);
        }
    }

    /// Take a chunk off its slot list without dropping it.
    pub fn detach(&mut self, id: ChunkId) {
        self.unlink(id);
    }
}
