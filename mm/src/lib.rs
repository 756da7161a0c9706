#![no_std]

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod bitmap;
pub mod error;
pub mod mm_constants;
pub mod percpu;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use error::{PcpuError, PcpuResult};
pub use percpu::{
    AllocFlags, AllocInfo, ChunkBackend, GroupInfo, PcpuAllocator, PcpuPtr, PcpuStats, UnitLayout,
    alloc_percpu, alloc_percpu_atomic, alloc_reserved_percpu, free_percpu, is_percpu_address,
    pcpu_allocator, pcpu_init, setup_first_chunk,
};
