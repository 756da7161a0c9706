//! Bootstrap from the pre-mapped boot area.
//!
//! Each unit of the boot area is laid out as
//!
//! ```text
//! | static | reserved | dynamic | unused |
//! ```
//!
//! The static part is owned by the embedder. The reserved part, when
//! present, becomes the reserved chunk; the dynamic part becomes the first
//! chunk. Without a reserved part a single chunk serves the dynamic region.
//! Both chunks are immutable and fully populated.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use pcpu_lib::{IrqMutex, KlogLevel, WarnLimit, align_down, klog_debug, klog_error};

use super::balance::BalanceWork;
use super::{AllocInfo, Chunk, ChunkBackend, ChunkTable, PcpuAllocator, PcpuState, PcpuStats, UnitLayout};
use crate::error::{PcpuError, PcpuResult};
use crate::mm_constants::{
    PAGE_SHIFT, PAGE_SIZE, PCPU_MIN_ALLOC_SIZE, PCPU_MIN_UNIT_SIZE, PCPU_WARN_LIMIT,
    PERCPU_DYNAMIC_EARLY_SIZE,
};

/// Fail with the text of the first condition that holds.
macro_rules! setup_bail_if {
    ($cond:expr) => {
        if $cond {
            return Err(PcpuError::InvalidLayout(stringify!($cond)));
        }
    };
}

fn validate(ai: &AllocInfo, base_addr: usize, backend: &dyn ChunkBackend) -> PcpuResult<UnitLayout> {
    let size_sum = ai.static_size + ai.reserved_size + ai.dyn_size;

    setup_bail_if!(ai.groups.is_empty());
    setup_bail_if!(ai.static_size == 0);
    setup_bail_if!(base_addr == 0);
    setup_bail_if!(base_addr % PAGE_SIZE != 0);
    setup_bail_if!(ai.unit_size < size_sum);
    setup_bail_if!(ai.unit_size % PAGE_SIZE != 0);
    setup_bail_if!(ai.unit_size < PCPU_MIN_UNIT_SIZE);
    setup_bail_if!(ai.reserved_size != 0 && (ai.static_size + ai.reserved_size) % PAGE_SIZE != 0);
    setup_bail_if!(ai.dyn_size < PERCPU_DYNAMIC_EARLY_SIZE);

    backend.verify_layout(ai)?;
    UnitLayout::from_alloc_info(ai)
}

/// Validate `ai`, carve the boot chunks out of the area at `base_addr` and
/// build an allocator around them.
///
/// Every unit at `base_addr + unit offset` must already be mapped for
/// `ai.unit_size` bytes. A rejected layout is dumped at error level.
pub fn setup_first_chunk(
    ai: &AllocInfo,
    base_addr: usize,
    backend: Box<dyn ChunkBackend>,
) -> PcpuResult<PcpuAllocator> {
    let layout = validate(ai, base_addr, backend.as_ref()).inspect_err(|err| {
        klog_error!("percpu: {}", err);
        ai.dump(KlogLevel::Error);
    })?;
    ai.dump(KlogLevel::Debug);

    // The chunk after the static area needs a page-aligned base; the
    // static tail below it is hidden as an allocated prefix.
    let tmp_addr = base_addr + ai.static_size;
    let aligned_addr = align_down(tmp_addr, PAGE_SIZE);
    let reserved_offset = tmp_addr - aligned_addr;
    let begin_fill_bits = reserved_offset.div_ceil(PCPU_MIN_ALLOC_SIZE);

    let region_size = if ai.reserved_size != 0 {
        ai.reserved_size
    } else {
        ai.dyn_size
    };
    let map_size = region_size + reserved_offset;

    let mut chunks = ChunkTable::new(layout.unit_bits());
    let mut chunk = Chunk::new_first(aligned_addr, map_size >> PAGE_SHIFT);
    chunk.hide_prefix(begin_fill_bits);

    let (first_chunk, reserved_chunk) = if ai.reserved_size != 0 {
        let reserved = chunks.insert(chunk);
        let dyn_chunk = Chunk::new_first(
            base_addr + ai.static_size + ai.reserved_size,
            ai.dyn_size >> PAGE_SHIFT,
        );
        (chunks.insert(dyn_chunk), Some(reserved))
    } else {
        (chunks.insert(chunk), None)
    };
    chunks.link_new(first_chunk);

    let nr_empty_pop_pages = chunks
        .get(first_chunk)
        .map_or(0, Chunk::nr_empty_pop_pages);
    let mut stats = PcpuStats::default();
    stats.chunk_alloc();

    if let Some(first) = chunks.get(first_chunk) {
        klog_debug!(
            "percpu: first chunk {:#x}, {} pages, {} units of {} bytes",
            first.base_addr(),
            first.nr_pages(),
            layout.nr_units(),
            layout.unit_size()
        );
    }

    Ok(PcpuAllocator {
        state: IrqMutex::new(PcpuState {
            chunks,
            page_owner: BTreeMap::new(),
            nr_empty_pop_pages,
            first_chunk,
            reserved_chunk,
            reserved_offset,
            stats,
        }),
        alloc_mutex: spin::Mutex::new(()),
        layout,
        backend,
        balance: BalanceWork::new(),
        warn_limit: WarnLimit::new(PCPU_WARN_LIMIT),
        base_addr,
        static_size: ai.static_size,
    })
}
