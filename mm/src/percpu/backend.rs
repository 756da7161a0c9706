//! Address-space and page hooks the allocator drives but does not own.

use super::layout::{AllocInfo, UnitLayout};
use crate::error::PcpuResult;

/// The embedder's chunk memory provider.
///
/// Every call is made with the allocator's interrupt-safe lock dropped, so
/// implementations may block. Page ranges are chunk page indices
/// `[page_start, page_end)` and apply to every CPU's unit.
pub trait ChunkBackend: Send + Sync {
    /// Reserve address space for a new chunk of `layout.chunk_span()` bytes
    /// and return its base. Nothing is populated yet.
    fn create_chunk(&self, layout: &UnitLayout) -> PcpuResult<usize>;

    /// Release a chunk's address space. Every page has been depopulated.
    fn destroy_chunk(&self, base: usize, layout: &UnitLayout);

    /// Back the pages with memory in every unit.
    fn populate(&self, base: usize, page_start: usize, page_end: usize, layout: &UnitLayout)
    -> PcpuResult;

    fn depopulate(&self, base: usize, page_start: usize, page_end: usize, layout: &UnitLayout);

    /// Page frame number behind a populated address.
    fn addr_to_page(&self, addr: usize) -> Option<usize>;

    /// Extra layout checks the backend imposes on the boot area, run while
    /// the first chunk is set up.
    fn verify_layout(&self, _ai: &AllocInfo) -> PcpuResult {
        Ok(())
    }
}
