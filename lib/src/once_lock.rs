//! Thread-safe lazy initialization container.
//!
//! [`OnceLock<T>`] provides one-time initialization with [`call_once()`] or the
//! fallible [`try_call_once()`], and subsequent access via [`get()`]. The first
//! caller runs the initializer; concurrent callers spin until it finishes.
//!
//! [`call_once()`]: OnceLock::call_once
//! [`try_call_once()`]: OnceLock::try_call_once
//! [`get()`]: OnceLock::get

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const STATE_UNINIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_COMPLETE: u8 = 2;

/// A thread-safe container for one-time initialization.
///
/// # Example
///
/// ```ignore
/// use pcpu_lib::OnceLock;
///
/// static ALLOCATOR: OnceLock<Allocator> = OnceLock::new();
///
/// fn init(layout: Layout) -> Result<(), Error> {
///     ALLOCATOR.try_call_once(|| Allocator::new(layout)).map(|_| ())
/// }
/// ```
pub struct OnceLock<T> {
    /// 0 = uninit, 1 = initializer running, 2 = complete.
    state: AtomicU8,
    data: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: only the thread that wins UNINIT -> RUNNING writes the value;
// readers only see it after the Release store of COMPLETE.
unsafe impl<T: Send + Sync> Send for OnceLock<T> {}
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> OnceLock<T> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Initialize the value if not yet initialized.
    #[inline]
    pub fn call_once(&self, f: impl FnOnce() -> T) -> &T {
        match self.try_call_once(|| Ok::<T, core::convert::Infallible>(f())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`call_once`](Self::call_once).
    ///
    /// When the initializer fails the cell goes back to uninitialized and the
    /// error is returned; a later caller may try again. When the cell is
    /// already set the closure is not run and the existing value is returned.
    pub fn try_call_once<E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        loop {
            if let Some(value) = self.get() {
                return Ok(value);
            }

            if self
                .state
                .compare_exchange(
                    STATE_UNINIT,
                    STATE_RUNNING,
                    Ordering::Acquire,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return match f() {
                    Ok(value) => {
                        // SAFETY: STATE_RUNNING makes us the sole writer.
                        unsafe { (*self.data.get()).write(value) };
                        self.state.store(STATE_COMPLETE, Ordering::Release);
                        // SAFETY: just written and published.
                        Ok(unsafe { (*self.data.get()).assume_init_ref() })
                    }
                    Err(err) => {
                        self.state.store(STATE_UNINIT, Ordering::Release);
                        Err(err)
                    }
                };
            }

            while self.state.load(Ordering::Acquire) == STATE_RUNNING {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == STATE_COMPLETE {
            // SAFETY: COMPLETE is published with Release after the write.
            Some(unsafe { (*self.data.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPLETE
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == STATE_COMPLETE {
            // SAFETY: COMPLETE means the value was initialized.
            unsafe { self.data.get_mut().assume_init_drop() };
        }
    }
}
