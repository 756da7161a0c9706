//! Per-CPU area allocator.
//!
//! Every allocation is one offset valid in each CPU's private replica
//! ("unit") of a chunk. Chunks track free space with an allocation bitmap
//! summarised by per-page [`BlockMd`] hints, are bucketed into slots by free
//! space, get backing pages lazily and are reclaimed or pre-populated by the
//! balance work.
//!
//! # Locking
//!
//! * `state` is an [`IrqMutex`] guarding every chunk, the slot lists, the
//!   page owner table and the counters. It is never held across a backend
//!   call.
//! * `alloc_mutex` serializes the blocking "search, create, populate"
//!   sequence and the balance work; it may be held across backend calls.
//!   Atomic callers never take it.

pub mod backend;
mod balance;
mod block;
mod chunk;
mod first_chunk;
pub mod layout;
mod slots;
mod stats;
#[cfg(any(test, feature = "std"))]
pub mod worker;


use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroUsize;

use bitflags::bitflags;
use pcpu_lib::{
    IrqMutex, OnceLock, WarnBudget, WarnLimit, align_up, is_power_of_two_usize, klog_info,
    klog_warn, pfn_down, pfn_up,
};

use crate::error::{PcpuError, PcpuResult};
use crate::mm_constants::{
    PAGE_SHIFT, PAGE_SIZE, PCPU_EMPTY_POP_PAGES_LOW, PCPU_MIN_ALLOC_SHIFT, PCPU_MIN_ALLOC_SIZE,
    PCPU_MIN_UNIT_SIZE, PCPU_WARN_LIMIT,
};

pub use backend::ChunkBackend;
pub use balance::BalanceKick;
pub use block::BlockMd;
pub use chunk::Chunk;
pub use first_chunk::setup_first_chunk;
pub use layout::{AllocInfo, GroupInfo, UnitLayout};
pub use slots::{ChunkId, ChunkTable};
pub use stats::PcpuStats;

use balance::BalanceWork;

/// CPU whose copy of a static variable is the canonical one.
const BOOT_CPU: usize = 0;

bitflags! {
    /// How an allocation may be served.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Never block: serve only from already populated pages and never
        /// create a chunk.
        const ATOMIC = 1 << 0;
        /// Serve from the reserved chunk when there is one.
        const RESERVED = 1 << 1;
    }
}

/// Address of an area in unit 0's coordinates; [`PcpuAllocator::per_cpu_ptr`]
/// turns it into a CPU's replica.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PcpuPtr(NonZeroUsize);

impl PcpuPtr {
    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for PcpuPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PcpuPtr({:#x})", self.addr())
    }
}

/// Everything behind the interrupt-safe lock.
pub(crate) struct PcpuState {
    chunks: ChunkTable,
    /// Page frame of every populated page of every unit of a dynamic chunk.
    page_owner: BTreeMap<usize, ChunkId>,
    /// Empty populated pages over all chunks but the reserved one.
    nr_empty_pop_pages: usize,
    first_chunk: ChunkId,
    reserved_chunk: Option<ChunkId>,
    /// Bytes of the static area the reserved chunk's base was pulled into.
    reserved_offset: usize,
    stats: PcpuStats,
}

impl PcpuState {
    /// Run `f` on a chunk, then fold its empty-page change into the global
    /// counter and move it to its new slot.
    fn with_chunk<R>(&mut self, id: ChunkId, f: impl FnOnce(&mut Chunk) -> R) -> Option<R> {
        let counted = self.reserved_chunk != Some(id);
        let chunk = self.chunks.get_mut(id)?;
        let before = chunk.nr_empty_pop_pages();
        let ret = f(chunk);
        let after = chunk.nr_empty_pop_pages();
        if counted {
            self.nr_empty_pop_pages = self.nr_empty_pop_pages + after - before;
        }
        self.chunks.relocate(id);
        Some(ret)
    }

    fn try_alloc(&mut self, id: ChunkId, bit_size: usize, bit_align: usize, atomic: bool) -> Option<usize> {
        let chunk = self.chunks.get(id)?;
        if bit_size > chunk.contig_hint() {
            return None;
        }
        let start = chunk.find_block_fit(bit_size, bit_align, atomic)?;
        self.with_chunk(id, |chunk| {
            if atomic {
                chunk.alloc_area_populated(bit_size, bit_align, start)
            } else {
                chunk.alloc_area(bit_size, bit_align, start)
            }
        })
        .flatten()
    }

    fn search_slots(&mut self, bit_size: usize, bit_align: usize, atomic: bool) -> Option<(ChunkId, usize)> {
        for slot in self.chunks.size_to_slot(bit_size)..self.chunks.nr_slots() {
            for id in self.chunks.slot_ids(slot) {
                if let Some(off) = self.try_alloc(id, bit_size, bit_align, atomic) {
                    return Some((id, off));
                }
            }
        }
        None
    }

    fn free_area(&mut self, id: ChunkId, off: usize) {
        if self.with_chunk(id, |chunk| chunk.free_area(off)).is_some() {
            self.stats.area_dealloc();
        }
    }

    fn insert_chunk(&mut self, chunk: Chunk) -> ChunkId {
        let id = self.chunks.insert(chunk);
        self.chunks.link_new(id);
        self.stats.chunk_alloc();
        id
    }

    fn mark_populated(&mut self, id: ChunkId, page_start: usize, page_end: usize, frames: &[usize]) {
        self.with_chunk(id, |chunk| chunk.mark_populated(page_start, page_end));
        for &pfn in frames {
            self.page_owner.insert(pfn, id);
        }
    }

    fn mark_depopulated(&mut self, id: ChunkId, page_start: usize, page_end: usize, frames: &[usize]) {
        self.with_chunk(id, |chunk| chunk.mark_depopulated(page_start, page_end));
        for pfn in frames {
            self.page_owner.remove(pfn);
        }
    }

    fn chunk_of(&self, addr: usize, pfn: Option<usize>) -> Option<ChunkId> {
        if self
            .chunks
            .get(self.first_chunk)
            .is_some_and(|chunk| chunk.contains(addr))
        {
            return Some(self.first_chunk);
        }
        if let Some(id) = self.reserved_chunk {
            let in_reserved = self.chunks.get(id).is_some_and(|chunk| {
                addr >= chunk.base_addr() + self.reserved_offset && chunk.contains(addr)
            });
            if in_reserved {
                return Some(id);
            }
        }
        pfn.and_then(|pfn| self.page_owner.get(&pfn).copied())
    }
}

pub struct PcpuAllocator {
    state: IrqMutex<PcpuState>,
    alloc_mutex: spin::Mutex<()>,
    layout: UnitLayout,
    backend: Box<dyn ChunkBackend>,
    balance: BalanceWork,
    warn_limit: WarnLimit,
    /// Start of the boot area; unit `u` of the static area is at
    /// `base_addr + unit_offset`.
    base_addr: usize,
    static_size: usize,
}

impl PcpuAllocator {
    pub fn layout(&self) -> &UnitLayout {
        &self.layout
    }

    /// Allocate a zeroed area of `size` bytes aligned to `align` in every
    /// unit.
    pub fn alloc(&self, size: usize, align: usize, flags: AllocFlags) -> PcpuResult<PcpuPtr> {
        let atomic = flags.contains(AllocFlags::ATOMIC);
        let reserved = flags.contains(AllocFlags::RESERVED);

        // The minimum allocation unit is also the minimum alignment.
        let align = align.max(PCPU_MIN_ALLOC_SIZE);
        if size == 0 || size > PCPU_MIN_UNIT_SIZE || align > PAGE_SIZE || !is_power_of_two_usize(align) {
            self.warn(format_args!(
                "illegal size ({}) or align ({}) for percpu allocation",
                size, align
            ));
            return Err(PcpuError::InvalidArgument { size, align });
        }
        let size = align_up(size, PCPU_MIN_ALLOC_SIZE);
        let bit_size = size >> PCPU_MIN_ALLOC_SHIFT;
        let bit_align = align >> PCPU_MIN_ALLOC_SHIFT;

        let alloc_guard = (!atomic).then(|| self.alloc_mutex.lock());
        let fail = |err: &str, error: PcpuError| self.alloc_failed(size, align, atomic, err, error);

        let mut state = self.state.lock();
        let (id, off) = loop {
            if reserved && let Some(id) = state.reserved_chunk {
                match state.try_alloc(id, bit_size, bit_align, atomic) {
                    Some(off) => break (id, off),
                    None => {
                        drop(state);
                        return fail("alloc from reserved chunk failed", PcpuError::NoSpace);
                    }
                }
            }

            if let Some(found) = state.search_slots(bit_size, bit_align, atomic) {
                break found;
            }

            if atomic {
                drop(state);
                return fail("atomic alloc failed, no space left", PcpuError::AtomicNoSpace);
            }
            // A fully free chunk fits any valid request.
            if !state.chunks.slot_is_empty(state.chunks.top_slot()) {
                drop(state);
                return fail("no space left in any chunk", PcpuError::NoSpace);
            }

            drop(state);
            let chunk = match self.backend.create_chunk(&self.layout) {
                Ok(base) => Chunk::new(base, self.layout.unit_pages()),
                Err(_) => return fail("failed to allocate new chunk", PcpuError::ChunkCreateFailed),
            };
            state = self.state.lock();
            state.insert_chunk(chunk);
        };

        state.stats.area_alloc(size);
        let (base, unpopulated) = match state.chunks.get(id) {
            Some(chunk) if !atomic => (
                chunk.base_addr(),
                chunk.unpopulated_regions(pfn_down(off, PAGE_SHIFT), pfn_up(off + size, PAGE_SHIFT)),
            ),
            Some(chunk) => (chunk.base_addr(), Vec::new()),
            None => {
                drop(state);
                return fail("chunk vanished", PcpuError::NoSpace);
            }
        };
        drop(state);

        for (rs, re) in unpopulated {
            let ret = self.backend.populate(base, rs, re, &self.layout);
            let frames = if ret.is_ok() { self.page_frames(base, rs, re) } else { Vec::new() };
            let mut state = self.state.lock();
            if ret.is_err() {
                state.free_area(id, off);
                drop(state);
                return fail("failed to populate", PcpuError::PopulateFailed);
            }
            state.mark_populated(id, rs, re, &frames);
        }
        drop(alloc_guard);

        if self.state.lock().nr_empty_pop_pages < PCPU_EMPTY_POP_PAGES_LOW {
            self.schedule_balance();
        }

        for cpu in self.layout.cpus() {
            let dst = (self.layout.chunk_addr(base, cpu, 0) + off) as *mut u8;
            // SAFETY: the area was just handed out to us alone and every
            // page under it is populated in every unit.
            unsafe { core::ptr::write_bytes(dst, 0, size) };
        }

        PcpuPtr::from_addr(base + off).ok_or(PcpuError::NoSpace)
    }

    /// Blocking allocation from the dynamic chunks.
    pub fn alloc_percpu(&self, size: usize, align: usize) -> PcpuResult<PcpuPtr> {
        self.alloc(size, align, AllocFlags::empty())
    }

    /// Non-blocking allocation; may be called where sleeping is not allowed.
    pub fn alloc_percpu_atomic(&self, size: usize, align: usize) -> PcpuResult<PcpuPtr> {
        self.alloc(size, align, AllocFlags::ATOMIC)
    }

    /// Blocking allocation from the reserved chunk, or from the dynamic
    /// chunks when no reserved region was set up.
    pub fn alloc_reserved_percpu(&self, size: usize, align: usize) -> PcpuResult<PcpuPtr> {
        self.alloc(size, align, AllocFlags::RESERVED)
    }

    fn alloc_failed(
        &self,
        size: usize,
        align: usize,
        atomic: bool,
        err: &str,
        error: PcpuError,
    ) -> PcpuResult<PcpuPtr> {
        if atomic {
            self.balance.note_atomic_failure();
            self.schedule_balance();
        } else {
            self.warn(format_args!(
                "allocation failed, size={} align={} atomic={}, {}",
                size, align, atomic as u8, err
            ));
        }
        Err(error)
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        let budget = self.warn_limit.take();
        if budget == WarnBudget::Silenced {
            return;
        }
        klog_warn!("percpu: {}", args);
        if budget == WarnBudget::Last {
            klog_info!("percpu: limit reached, disable warning");
        }
    }

    /// Frame numbers of pages `[page_start, page_end)` in every unit.
    fn page_frames(&self, base: usize, page_start: usize, page_end: usize) -> Vec<usize> {
        let mut frames = Vec::with_capacity(self.layout.nr_cpus() * (page_end - page_start));
        for cpu in self.layout.cpus() {
            for page in page_start..page_end {
                if let Some(pfn) = self.backend.addr_to_page(self.layout.chunk_addr(base, cpu, page)) {
                    frames.push(pfn);
                }
            }
        }
        frames
    }

    /// Reserve a fresh chunk and list it in the top slot.
    fn create_chunk(&self) -> PcpuResult<ChunkId> {
        let base = self.backend.create_chunk(&self.layout)?;
        let chunk = Chunk::new(base, self.layout.unit_pages());
        Ok(self.state.lock().insert_chunk(chunk))
    }

    /// Release an area returned by [`PcpuAllocator::alloc`].
    ///
    /// # Panics
    ///
    /// When `ptr` does not point at the start of a live area.
    pub fn free(&self, ptr: PcpuPtr) {
        let addr = ptr.addr();
        // Unit 0 may be unused; look the address up in a unit that exists.
        let pfn = self
            .backend
            .addr_to_page(addr + self.layout.unit_offset(self.layout.low_unit_cpu()));

        let mut state = self.state.lock();
        let Some(id) = state.chunk_of(addr, pfn) else {
            drop(state);
            panic!("percpu: freeing untracked pointer {:#x}", addr);
        };
        let (off, live) = match state.chunks.get(id) {
            Some(chunk) => {
                let off = addr - chunk.base_addr();
                let hidden = chunk.has_reserved() && off < state.reserved_offset;
                (off, !hidden && chunk.is_area_start(off))
            }
            None => (0, false),
        };
        if !live {
            drop(state);
            panic!("percpu: {:#x} is not the start of a live area", addr);
        }

        state.free_area(id, off);

        let unit_bits = self.layout.unit_bits();
        let top = state.chunks.top_slot();
        let reap = state.chunks.get(id).is_some_and(|chunk| chunk.free_bits() == unit_bits)
            && state.chunks.slot_ids(top).iter().any(|&other| other != id);
        drop(state);

        if reap {
            self.schedule_balance();
        }
    }

    /// `ptr`'s replica in `cpu`'s unit.
    #[inline]
    pub fn per_cpu_ptr(&self, ptr: PcpuPtr, cpu: usize) -> *mut u8 {
        (ptr.addr() + self.layout.unit_offset(cpu)) as *mut u8
    }

    /// Whether `addr` points into the static area of any unit.
    pub fn is_percpu_address(&self, addr: usize) -> bool {
        self.canonical_percpu_address(addr).is_some()
    }

    /// The boot CPU's copy of the static variable `addr` points into, when
    /// `addr` lies in the static area of any unit.
    pub fn canonical_percpu_address(&self, addr: usize) -> Option<usize> {
        self.layout.cpus().find_map(|cpu| {
            let start = self.base_addr + self.layout.unit_offset(cpu);
            (addr >= start && addr < start + self.static_size)
                .then(|| addr - start + self.base_addr + self.layout.unit_offset(BOOT_CPU))
        })
    }

    /// Physical address behind `addr`, a static per-CPU address or a
    /// replica returned by [`PcpuAllocator::per_cpu_ptr`].
    ///
    /// Outside the boot units only pages populated for a live chunk
    /// translate; anything else is `None`.
    pub fn per_cpu_ptr_to_phys(&self, addr: usize) -> Option<usize> {
        let unit_size = self.layout.unit_size();
        let in_first_chunk = self.layout.cpus().any(|cpu| {
            let start = self.base_addr + self.layout.unit_offset(cpu);
            addr >= start && addr < start + unit_size
        });

        let pfn = self.backend.addr_to_page(addr)?;
        if !in_first_chunk && !self.state.lock().page_owner.contains_key(&pfn) {
            return None;
        }
        Some((pfn << PAGE_SHIFT) + (addr & (PAGE_SIZE - 1)))
    }

    pub fn stats(&self) -> PcpuStats {
        let state = self.state.lock();
        PcpuStats {
            empty_pop_pages: state.nr_empty_pop_pages,
            ..state.stats
        }
    }

    pub fn nr_empty_pop_pages(&self) -> usize {
        self.state.lock().nr_empty_pop_pages
    }

    /// Chunks currently owned, including the boot chunks.
    pub fn nr_chunks(&self) -> usize {
        self.state.lock().chunks.len()
    }
}

impl Drop for PcpuAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for id in state.chunks.ids() {
            let Some(chunk) = state.chunks.remove(id) else {
                continue;
            };
            if chunk.is_immutable() {
                continue;
            }
            for (rs, re) in chunk.populated_regions(0, chunk.nr_pages()) {
                self.backend.depopulate(chunk.base_addr(), rs, re, &self.layout);
            }
            self.backend.destroy_chunk(chunk.base_addr(), &self.layout);
        }
    }
}

impl fmt::Debug for PcpuAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcpuAllocator")
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .field("static_size", &self.static_size)
            .field("unit_size", &self.layout.unit_size())
            .field("nr_units", &self.layout.nr_units())
            .finish()
    }
}

static PCPU_ALLOCATOR: OnceLock<PcpuAllocator> = OnceLock::new();

/// Set up the process-wide allocator from the boot area at `base_addr`.
///
/// Once an allocator is installed later calls return it unchanged and drop
/// their `backend`.
pub fn pcpu_init(
    ai: &AllocInfo,
    base_addr: usize,
    backend: Box<dyn ChunkBackend>,
) -> PcpuResult<&'static PcpuAllocator> {
    PCPU_ALLOCATOR.try_call_once(|| setup_first_chunk(ai, base_addr, backend))
}

pub fn pcpu_allocator() -> Option<&'static PcpuAllocator> {
    PCPU_ALLOCATOR.get()
}

fn installed() -> PcpuResult<&'static PcpuAllocator> {
    pcpu_allocator().ok_or(PcpuError::NotInitialized)
}

pub fn alloc_percpu(size: usize, align: usize) -> PcpuResult<PcpuPtr> {
    installed()?.alloc_percpu(size, align)
}

pub fn alloc_percpu_atomic(size: usize, align: usize) -> PcpuResult<PcpuPtr> {
    installed()?.alloc_percpu_atomic(size, align)
}

pub fn alloc_reserved_percpu(size: usize, align: usize) -> PcpuResult<PcpuPtr> {
    installed()?.alloc_reserved_percpu(size, align)
}

/// # Panics
///
/// When no allocator is installed or `ptr` is not a live area.
pub fn free_percpu(ptr: PcpuPtr) {
    match pcpu_allocator() {
        Some(allocator) => allocator.free(ptr),
        None => panic!("percpu: free of {:#x} before init", ptr.addr()),
    }
}

pub fn is_percpu_address(addr: usize) -> bool {
    pcpu_allocator().is_some_and(|allocator| allocator.is_percpu_address(addr))
}
