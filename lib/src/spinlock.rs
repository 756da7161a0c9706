use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Saves the local interrupt state and masks interrupts; the returned word is
/// handed back to the matching restore hook.
pub type IrqSaveFn = fn() -> u64;
pub type IrqRestoreFn = fn(u64);

/// `null` means "no hook installed".
static IRQ_SAVE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static IRQ_RESTORE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install the embedder's interrupt save/restore pair.
///
/// Hosted builds never call this and get no-op hooks.
pub fn register_irq_ops(save: IrqSaveFn, restore: IrqRestoreFn) {
    IRQ_SAVE.store(save as *mut (), Ordering::Release);
    IRQ_RESTORE.store(restore as *mut (), Ordering::Release);
}

#[inline]
fn irq_save() -> u64 {
    let ptr = IRQ_SAVE.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: only `IrqSaveFn` pointers are ever stored in IRQ_SAVE.
    let save: IrqSaveFn = unsafe { core::mem::transmute(ptr) };
    save()
}

#[inline]
fn irq_restore(flags: u64) {
    let ptr = IRQ_RESTORE.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: only `IrqRestoreFn` pointers are ever stored in IRQ_RESTORE.
    let restore: IrqRestoreFn = unsafe { core::mem::transmute(ptr) };
    restore(flags);
}

/// Spinlock that masks local interrupts while held.
///
/// Used for state touched from atomic context: the holder never sleeps and
/// never calls back into the chunk backend.
pub struct IrqMutex<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex provides exclusive access through atomic locking.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_flags: u64,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_flags = irq_save();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }

        IrqMutexGuard {
            mutex: self,
            saved_flags,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let saved_flags = irq_save();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                saved_flags,
            })
        } else {
            irq_restore(saved_flags);
            None
        }
    }

    /// Exclusive access without locking; the borrow checker proves no guard
    /// is live.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.store(false, Ordering::Release);
        irq_restore(self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_excludes_try_lock() {
        let m = IrqMutex::new(5u32);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.is_locked());
            assert!(m.try_lock().is_none());
        }
        assert!(!m.is_locked());
        assert_eq!(*m.try_lock().unwrap(), 6);
    }
}
