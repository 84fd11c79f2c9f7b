//! Fixed worker pool — the blocking fallback executor.
//!
//! N OS threads sharing the process context (credentials, filesystem
//! view, descriptor table come along for free in-process). Work items
//! queue on an unbounded MPMC queue so enqueue never fails once a
//! request's cancel handler is installed; only N items execute at a
//! time and each may block for as long as the operation takes.
//!
//! Late-stage cancellation interrupts a blocked worker with SIGURG.
//! The handler is an installed-once no-op *without* SA_RESTART, which
//! is exactly what makes the blocking syscall return EINTR instead of
//! resuming.
//!
//! Shutdown drains the queue and joins the workers; the service layer
//! guarantees outstanding blocking operations are cancelled first.

use aring_core::executor::{WorkItem, WorkerExecutor};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

extern "C" fn on_sigurg(_: libc::c_int) {
    // The delivery itself is the point: it yanks the worker out of a
    // blocking syscall with EINTR.
}

/// Install the cancellation signal handler, once per process.
pub(crate) fn install_cancel_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        #[cfg(unix)]
        {
            let act = SigAction::new(
                SigHandler::Handler(on_sigurg),
                SaFlags::empty(), // no SA_RESTART
                SigSet::empty(),
            );
            if let Err(e) = unsafe { signal::sigaction(Signal::SIGURG, &act) } {
                log::warn!("sigaction(SIGURG) failed: {}; late cancel degraded", e);
            }
        }
    });
}

/// Deliver the cancellation interrupt to a worker thread.
/// `task` is the worker's `pthread_self()` recorded in the request.
pub(crate) fn interrupt_worker(task: u64) -> bool {
    #[cfg(unix)]
    {
        nix::sys::pthread::pthread_kill(task as libc::pthread_t, Signal::SIGURG).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = task;
        false
    }
}

struct PoolInner {
    queue: SegQueue<WorkItem>,
    active: AtomicUsize,
    shutdown: AtomicBool,
    total: usize,
    /// Parked worker handles for wake-on-push.
    threads: Mutex<Vec<thread::Thread>>,
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FixedPool {
    /// Create a pool with `n` workers (clamped to 1..=32).
    pub fn new(n: usize) -> Self {
        install_cancel_handler();

        let n = n.clamp(1, 32);
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            total: n,
            threads: Mutex::new(Vec::with_capacity(n)),
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("aring-worker-{}", worker_id))
                .spawn(move || {
                    inner.threads.lock().unwrap().push(thread::current());
                    worker_loop(&inner);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        log::debug!("worker pool up: {} threads", n);

        FixedPool {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Default sizing: min(8, nproc/2), at least 2.
    pub fn auto_sized() -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new((cpus / 2).clamp(2, 8))
    }
}

impl WorkerExecutor for FixedPool {
    fn spawn(&self, work: WorkItem) {
        self.inner.queue.push(work);
        for t in self.inner.threads.lock().unwrap().iter() {
            t.unpark();
        }
    }

    fn active(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn total(&self) -> usize {
        self.inner.total
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for t in self.inner.threads.lock().unwrap().iter() {
            t.unpark();
        }
        let mut handles = self.handles.lock().unwrap();
        for h in handles.drain(..) {
            let _ = h.join();
        }
        log::debug!("worker pool down");
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        if !self.inner.shutdown.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        match inner.queue.pop() {
            Some(work) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                work();
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                if inner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                thread::park_timeout(Duration::from_millis(1));
            }
        }
    }
}
