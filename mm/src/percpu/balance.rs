//! Background upkeep: reclaim surplus free chunks and keep enough populated
//! pages around for atomic allocations.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use pcpu_lib::{klog_debug, klog_warn};

use super::{ChunkId, PcpuAllocator};
use crate::mm_constants::{PCPU_BITMAP_BLOCK_BITS, PCPU_EMPTY_POP_PAGES_HIGH};

/// Wakes whatever context runs [`PcpuAllocator::run_pending_balance`].
pub type BalanceKick = Box<dyn Fn() + Send + Sync>;

/// "Schedule if not already scheduled" state of the balance work.
pub(super) struct BalanceWork {
    pending: AtomicBool,
    async_enabled: AtomicBool,
    /// An atomic allocation starved since the last run.
    atomic_alloc_failed: AtomicBool,
    kick: spin::Once<BalanceKick>,
}

impl BalanceWork {
    pub(super) const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            async_enabled: AtomicBool::new(false),
            atomic_alloc_failed: AtomicBool::new(false),
            kick: spin::Once::new(),
        }
    }

    fn kick(&self) {
        if !self.async_enabled.load(Ordering::Acquire) {
            return;
        }
        if let Some(kick) = self.kick.get() {
            kick();
        }
    }

    fn schedule(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.kick();
        }
    }

    fn enable(&self, kick: BalanceKick) {
        self.kick.call_once(|| kick);
        self.async_enabled.store(true, Ordering::Release);
        if self.pending.load(Ordering::Acquire) {
            self.kick();
        }
    }

    pub(super) fn note_atomic_failure(&self) {
        self.atomic_alloc_failed.store(true, Ordering::Release);
    }
}

impl PcpuAllocator {
    /// Ask for a balance run. The kick installed by
    /// [`PcpuAllocator::enable_async`] fires only when the work was not
    /// already pending.
    pub fn schedule_balance(&self) {
        self.balance.schedule();
    }

    /// Install the hook that wakes whatever runs
    /// [`PcpuAllocator::run_pending_balance`]. Only the first hook is kept.
    pub fn enable_async(&self, kick: BalanceKick) {
        self.balance.enable(kick);
    }

    pub fn balance_pending(&self) -> bool {
        self.balance.pending.load(Ordering::Acquire)
    }

    /// Run the balance work if it was scheduled. Returns whether it ran.
    pub fn run_pending_balance(&self) -> bool {
        if !self.balance.pending.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.balance_workfn();
        true
    }

    /// Reclaim, then pre-populate, under the alloc mutex.
    pub fn balance_workfn(&self) {
        let _guard = self.alloc_mutex.lock();
        let reclaimed = self.reclaim_locked();
        let populated = self.prepopulate_locked();
        klog_debug!(
            "percpu: balance reclaimed {} chunks, populated {} pages",
            reclaimed,
            populated
        );
    }

    /// Destroy every entirely free chunk but one. Returns how many went.
    pub fn reclaim(&self) -> usize {
        let _guard = self.alloc_mutex.lock();
        self.reclaim_locked()
    }

    /// Populate pages until the empty populated page count reaches its
    /// high watermark. Returns the number of pages populated.
    pub fn prepopulate(&self) -> usize {
        let _guard = self.alloc_mutex.lock();
        self.prepopulate_locked()
    }

    fn reclaim_locked(&self) -> usize {
        let doomed: Vec<(ChunkId, usize, Vec<(usize, usize)>)> = {
            let mut state = self.state.lock();
            let top = state.chunks.top_slot();
            let mut doomed = Vec::new();
            // The head of the free list stays as a spare.
            for id in state.chunks.slot_ids(top).into_iter().skip(1) {
                let Some(chunk) = state.chunks.get(id) else {
                    continue;
                };
                if chunk.is_immutable() {
                    klog_warn!("percpu: immutable chunk {:#x} in free slot", chunk.base_addr());
                    continue;
                }
                let entry = (id, chunk.base_addr(), chunk.populated_regions(0, chunk.nr_pages()));
                state.chunks.detach(id);
                doomed.push(entry);
            }
            doomed
        };

        for (id, base, regions) in &doomed {
            for &(rs, re) in regions {
                let frames = self.page_frames(*base, rs, re);
                self.backend.depopulate(*base, rs, re, &self.layout);
                self.state.lock().mark_depopulated(*id, rs, re, &frames);
            }
            {
                let mut state = self.state.lock();
                state.chunks.remove(*id);
                state.stats.chunk_dealloc();
            }
            self.backend.destroy_chunk(*base, &self.layout);
        }

        doomed.len()
    }

    /// Chunk with unpopulated pages in `slot`, with its base and holes.
    fn unpopulated_in_slot(&self, slot: usize) -> Option<(ChunkId, usize, Vec<(usize, usize)>)> {
        let state = self.state.lock();
        state.chunks.slot_ids(slot).into_iter().find_map(|id| {
            let chunk = state.chunks.get(id)?;
            if chunk.nr_populated() == chunk.nr_pages() {
                return None;
            }
            Some((id, chunk.base_addr(), chunk.unpopulated_regions(0, chunk.nr_pages())))
        })
    }

    fn prepopulate_locked(&self) -> usize {
        let mut total = 0;

        loop {
            let (mut nr_to_pop, first_slot, nr_slots) = {
                let state = self.state.lock();
                let nr_to_pop = if self.balance.atomic_alloc_failed.swap(false, Ordering::AcqRel) {
                    PCPU_EMPTY_POP_PAGES_HIGH
                } else {
                    PCPU_EMPTY_POP_PAGES_HIGH.saturating_sub(state.nr_empty_pop_pages)
                };
                (
                    nr_to_pop,
                    state.chunks.size_to_slot(PCPU_BITMAP_BLOCK_BITS),
                    state.chunks.nr_slots(),
                )
            };

            // Fill the most packed chunks first so atomic allocations do not
            // spread over empty ones.
            for slot in first_slot..nr_slots {
                if nr_to_pop == 0 {
                    break;
                }
                let Some((id, base, holes)) = self.unpopulated_in_slot(slot) else {
                    continue;
                };
                for (rs, re) in holes {
                    let nr = (re - rs).min(nr_to_pop);
                    match self.backend.populate(base, rs, rs + nr, &self.layout) {
                        Ok(()) => {
                            let frames = self.page_frames(base, rs, rs + nr);
                            self.state.lock().mark_populated(id, rs, rs + nr, &frames);
                            nr_to_pop -= nr;
                            total += nr;
                        }
                        Err(err) => {
                            klog_warn!("percpu: prepopulate failed: {}", err);
                            nr_to_pop = 0;
                        }
                    }
                    if nr_to_pop == 0 {
                        break;
                    }
                }
            }

            if nr_to_pop == 0 || self.create_chunk().is_err() {
                break;
            }
        }

        total
    }
}
