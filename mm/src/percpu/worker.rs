//! Hosted balance worker: one thread parked until the allocator kicks it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, Ordering};

use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use super::PcpuAllocator;

pub struct BalanceThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BalanceThread {
    /// Start the worker and make it the allocator's async balance target.
    ///
    /// `allocator` is anything that keeps the allocator alive for the
    /// thread's lifetime, an `Arc` or a `&'static`.
    pub fn spawn<A>(allocator: A) -> io::Result<Self>
    where
        A: Deref<Target = PcpuAllocator> + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        // The waker needs the thread handle, so the allocator is handed to
        // the thread once it exists.
        let (tx, rx) = mpsc::channel::<A>();
        let handle = thread::Builder::new()
            .name("pcpu-balance".into())
            .spawn(move || {
                let Ok(allocator) = rx.recv() else {
                    return;
                };
                while !stop.load(Ordering::Acquire) {
                    allocator.run_pending_balance();
                    thread::park();
                }
            })?;

        let waker = handle.thread().clone();
        allocator.enable_async(Box::new(move || waker.unpark()));
        // The receiver only goes away if the thread already died.
        let _ = tx.send(allocator);

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it; an in-flight balance pass finishes.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for BalanceThread {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
