use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::Mutex;

use crate::error::{PcpuError, PcpuResult};
use crate::mm_constants::{PAGE_SHIFT, PAGE_SIZE};
use crate::percpu::{AllocInfo, ChunkBackend, PcpuAllocator, UnitLayout, setup_first_chunk};

fn page_aligned(size: usize) -> Layout {
    Layout::from_size_align(size, PAGE_SIZE).unwrap()
}

/// Knobs and call counters shared between a test and its [`FakeBackend`].
#[derive(Default)]
pub struct BackendCounters {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub populated_pages: AtomicUsize,
    pub depopulated_pages: AtomicUsize,
    pub populate_calls: AtomicUsize,
    pub fail_populate: AtomicBool,
    pub fail_create: AtomicBool,
}

impl BackendCounters {
    pub fn populate_calls(&self) -> usize {
        self.populate_calls.load(Ordering::SeqCst)
    }

    pub fn live_chunks(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.destroyed.load(Ordering::SeqCst)
    }
}

/// Heap-backed chunks. Every chunk is fully backed from creation, so the
/// population calls only count.
pub struct FakeBackend {
    counters: Arc<BackendCounters>,
    chunks: Mutex<BTreeMap<usize, Layout>>,
}

impl FakeBackend {
    pub fn new(counters: Arc<BackendCounters>) -> Self {
        Self {
            counters,
            chunks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl ChunkBackend for FakeBackend {
    fn create_chunk(&self, layout: &UnitLayout) -> PcpuResult<usize> {
        if self.counters.fail_create.load(Ordering::SeqCst) {
            return Err(PcpuError::ChunkCreateFailed);
        }
        let mem_layout = page_aligned(layout.chunk_span());
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(mem_layout) };
        if ptr.is_null() {
            return Err(PcpuError::ChunkCreateFailed);
        }
        self.chunks.lock().unwrap().insert(ptr as usize, mem_layout);
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(ptr as usize)
    }

    fn destroy_chunk(&self, base: usize, _layout: &UnitLayout) {
        let mem_layout = self
            .chunks
            .lock()
            .unwrap()
            .remove(&base)
            .expect("destroying unknown chunk");
        // SAFETY: `base` came from `alloc_zeroed` with this layout.
        unsafe { dealloc(base as *mut u8, mem_layout) };
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn populate(&self, _base: usize, page_start: usize, page_end: usize, _layout: &UnitLayout) -> PcpuResult {
        self.counters.populate_calls.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_populate.load(Ordering::SeqCst) {
            return Err(PcpuError::PopulateFailed);
        }
        self.counters
            .populated_pages
            .fetch_add(page_end - page_start, Ordering::SeqCst);
        Ok(())
    }

    fn depopulate(&self, _base: usize, page_start: usize, page_end: usize, _layout: &UnitLayout) {
        self.counters
            .depopulated_pages
            .fetch_add(page_end - page_start, Ordering::SeqCst);
    }

    fn addr_to_page(&self, addr: usize) -> Option<usize> {
        Some(addr >> PAGE_SHIFT)
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        let chunks = core::mem::take(&mut *self.chunks.lock().unwrap());
        for (base, mem_layout) in chunks {
            // SAFETY: every entry came from `alloc_zeroed` with its layout.
            unsafe { dealloc(base as *mut u8, mem_layout) };
        }
    }
}

/// Zeroed, page-aligned stand-in for the pre-mapped boot area.
pub struct BootArea {
    base: usize,
    layout: Layout,
}

impl BootArea {
    pub fn new(ai: &AllocInfo) -> Self {
        let layout = page_aligned(ai.nr_units() * ai.unit_size);
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self {
            base: ptr as usize,
            layout,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl Drop for BootArea {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.base as *mut u8, self.layout) };
    }
}

/// An allocator over a [`BootArea`] and a [`FakeBackend`]. The allocator is
/// dropped before the area it points into.
pub struct TestPcpu {
    pub allocator: PcpuAllocator,
    pub counters: Arc<BackendCounters>,
    pub area: BootArea,
}

impl TestPcpu {
    pub fn new(ai: &AllocInfo) -> Self {
        let counters = Arc::new(BackendCounters::default());
        let area = BootArea::new(ai);
        let allocator = setup_first_chunk(ai, area.base(), Box::new(FakeBackend::new(Arc::clone(&counters))))
            .expect("first chunk setup");
        Self {
            allocator,
            counters,
            area,
        }
    }

    /// Two CPUs, a 0x1234-byte static area and no reserved region.
    pub fn simple() -> Self {
        Self::new(&AllocInfo::single_group(2, 0x1234, 0, 0))
    }

    pub fn with_reserved(reserved_size: usize) -> Self {
        Self::new(&AllocInfo::single_group(2, 0x2000, reserved_size, 0))
    }

    /// Leaked, for tests that need a `'static` allocator.
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }
}

impl Deref for TestPcpu {
    type Target = PcpuAllocator;

    fn deref(&self) -> &PcpuAllocator {
        &self.allocator
    }
}
