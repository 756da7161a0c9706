//! Error type for the per-CPU allocator.
//!
//! Every fallible operation returns [`PcpuResult`]. Usage bugs (freeing a
//! pointer no chunk owns) are not errors; they panic.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcpuError {
    /// Zero or oversized request, or an alignment that is not a power of two
    /// no larger than a page. The size is reported as requested.
    InvalidArgument { size: usize, align: usize },
    /// No chunk could serve a blocking request, including the reserved chunk.
    NoSpace,
    /// No already-populated region could serve an atomic request.
    AtomicNoSpace,
    /// The backend could not reserve address space for a new chunk.
    ChunkCreateFailed,
    /// Backing pages for a committed area could not be populated; the area
    /// was rolled back.
    PopulateFailed,
    /// The first-chunk description failed validation.
    InvalidLayout(&'static str),
    /// The process-wide allocator has not been set up.
    NotInitialized,
}

impl fmt::Display for PcpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { size, align } => write!(
                f,
                "illegal size ({}) or align ({}) for percpu allocation",
                size, align
            ),
            Self::NoSpace => write!(f, "no space left in any chunk"),
            Self::AtomicNoSpace => write!(f, "atomic alloc failed, no space left"),
            Self::ChunkCreateFailed => write!(f, "failed to allocate new chunk"),
            Self::PopulateFailed => write!(f, "failed to populate"),
            Self::InvalidLayout(cond) => write!(f, "failed to initialize, {}", cond),
            Self::NotInitialized => write!(f, "percpu allocator not initialized"),
        }
    }
}

pub type PcpuResult<T = ()> = Result<T, PcpuError>;
