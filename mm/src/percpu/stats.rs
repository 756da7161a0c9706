//! Allocation counters, updated under the allocator lock.

use pcpu_lib::klog_info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcpuStats {
    pub nr_alloc: u64,
    pub nr_dealloc: u64,
    pub nr_cur_alloc: u64,
    pub nr_max_alloc: u64,
    pub nr_chunks: u32,
    pub nr_max_chunks: u32,
    pub min_alloc_size: usize,
    pub max_alloc_size: usize,
    /// Global empty populated page count at snapshot time.
    pub empty_pop_pages: usize,
}

impl PcpuStats {
    pub(crate) fn area_alloc(&mut self, size: usize) {
        self.nr_alloc += 1;
        self.nr_cur_alloc += 1;
        self.nr_max_alloc = self.nr_max_alloc.max(self.nr_cur_alloc);
        self.min_alloc_size = if self.min_alloc_size == 0 {
            size
        } else {
            self.min_alloc_size.min(size)
        };
        self.max_alloc_size = self.max_alloc_size.max(size);
    }

    pub(crate) fn area_dealloc(&mut self) {
        self.nr_dealloc += 1;
        self.nr_cur_alloc = self.nr_cur_alloc.saturating_sub(1);
    }

    pub(crate) fn chunk_alloc(&mut self) {
        self.nr_chunks += 1;
        self.nr_max_chunks = self.nr_max_chunks.max(self.nr_chunks);
    }

    pub(crate) fn chunk_dealloc(&mut self) {
        self.nr_chunks = self.nr_chunks.saturating_sub(1);
    }

    pub fn dump(&self) {
        klog_info!("=== Percpu Allocator Statistics ===");
        klog_info!("Allocations: {} (current {}, max {})", self.nr_alloc, self.nr_cur_alloc, self.nr_max_alloc);
        klog_info!("Frees: {}", self.nr_dealloc);
        klog_info!("Chunks: {} (max {})", self.nr_chunks, self.nr_max_chunks);
        klog_info!("Alloc size: min {} max {} bytes", self.min_alloc_size, self.max_alloc_size);
        klog_info!("Empty populated pages: {}", self.empty_pop_pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_peaks() {
        let mut stats = PcpuStats::default();
        stats.area_alloc(16);
        stats.area_alloc(4);
        stats.area_dealloc();
        stats.area_alloc(64);
        stats.chunk_alloc();
        stats.chunk_alloc();
        stats.chunk_dealloc();

        assert_eq!((stats.nr_alloc, stats.nr_dealloc), (3, 1));
        assert_eq!((stats.nr_cur_alloc, stats.nr_max_alloc), (2, 2));
        assert_eq!((stats.min_alloc_size, stats.max_alloc_size), (4, 64));
        assert_eq!((stats.nr_chunks, stats.nr_max_chunks), (1, 2));
    }
}
