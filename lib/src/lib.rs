#![no_std]

pub mod alignment;
pub mod klog;
pub mod once_lock;
pub mod spinlock;

#[doc(hidden)]
pub use paste;

pub use alignment::{align_down_usize as align_down, align_up_usize as align_up};
pub use alignment::{fls, is_power_of_two_usize, pfn_down, pfn_up};
pub use klog::{KlogLevel, WarnBudget, WarnLimit, klog_register_backend, klog_set_level};
pub use once_lock::OnceLock;
pub use spinlock::{IrqMutex, IrqMutexGuard, register_irq_ops};
