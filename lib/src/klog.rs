//! Allocator logging.
//!
//! Every log line funnels through a single **backend** function pointer.
//! Until an embedder registers one, lines are dropped: the allocator runs
//! long before any console exists, and it must never block or allocate on
//! the logging path.
//!
//! # Backend contract
//!
//! The backend receives the pre-formatted arguments for a **single log line**
//! and is responsible for writing it atomically followed by a newline.
//!
//! # Registration
//!
//! ```ignore
//! pcpu_lib::klog::klog_register_backend(my_backend_fn);
//! ```

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, Ordering};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KlogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(KlogLevel::Info as u8);

#[inline(always)]
fn is_enabled(level: KlogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

/// Signature of a klog backend.
pub type KlogBackend = fn(fmt::Arguments<'_>);

/// Stored as a raw pointer; `null` means "no backend, drop the line".
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

#[inline]
fn dispatch(args: fmt::Arguments<'_>) {
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `klog_register_backend` only stores valid `KlogBackend` fn
    // pointers, which have the same size as `*mut ()`.
    let backend: KlogBackend = unsafe { core::mem::transmute(ptr) };
    backend(args);
}

/// Register the sink for all subsequent log lines.
pub fn klog_register_backend(backend: KlogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

pub fn klog_set_level(level: KlogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Emit a formatted log line at the given level.
///
/// The backend appends the trailing newline.
pub fn log_args(level: KlogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    dispatch(args);
}

/// Decrementing budget for a class of warnings.
///
/// Each [`WarnLimit::take`] consumes one unit; once the budget hits zero the
/// warning is silenced for good. `take` reports whether this call emptied the
/// budget so the caller can print a final "limit reached" line.
pub struct WarnLimit {
    remaining: AtomicU32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarnBudget {
    /// Emit the warning.
    Emit,
    /// Emit the warning; it was the last one.
    Last,
    /// Budget exhausted, stay quiet.
    Silenced,
}

impl WarnLimit {
    pub const fn new(budget: u32) -> Self {
        Self {
            remaining: AtomicU32::new(budget),
        }
    }

    pub fn take(&self) -> WarnBudget {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => WarnBudget::Last,
            Ok(_) => WarnBudget::Emit,
            Err(_) => WarnBudget::Silenced,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::klog::log_args($level, ::core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Warn, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Info, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Debug, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Trace, ::core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_limit_counts_down_then_silences() {
        let limit = WarnLimit::new(3);
        assert_eq!(limit.take(), WarnBudget::Emit);
        assert_eq!(limit.take(), WarnBudget::Emit);
        assert_eq!(limit.take(), WarnBudget::Last);
        assert_eq!(limit.take(), WarnBudget::Silenced);
        assert_eq!(limit.remaining(), 0);
    }

    static LINES: AtomicU32 = AtomicU32::new(0);

    fn count_line(_args: fmt::Arguments<'_>) {
        LINES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn level_filters_before_backend() {
        crate::klog_info!("dropped, no backend yet");
        klog_register_backend(count_line);
        klog_set_level(KlogLevel::Warn);

        crate::klog_info!("filtered");
        crate::klog_debug!("filtered");
        crate::klog_warn!("kept {}", 1);
        crate::klog!(KlogLevel::Error, "kept {}", 2);
        assert_eq!(LINES.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_budget_is_silent() {
        let limit = WarnLimit::new(0);
        assert_eq!(limit.take(), WarnBudget::Silenced);
    }
}
