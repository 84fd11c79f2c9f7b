//! Worker-thread executor seam (the blocking fallback path).
//!
//! Operations without a native path run on a pool of worker threads
//! that may block for arbitrarily long (that is the point). The service
//! hands the pool opaque work items; request bookkeeping, cancellation
//! and completion all happen inside the item.
//!
//! # Implementors
//!
//! - `FixedPool` (default, in the `aring` crate): N OS threads sharing
//!   the process context, unbounded work queue.
//! - Tests: an inline executor that runs the item on the caller —
//!   blocks the submitter, unit tests only.

/// An enqueued fallback operation.
pub type WorkItem = Box<dyn FnOnce() + Send>;

/// Executes blocking operations on dedicated threads.
///
/// **Contract:**
/// - `spawn` never blocks and never fails; once a request's cancel
///   handler is installed it must be guaranteed to reach a worker.
/// - Items may block indefinitely; the pool must tolerate every worker
///   being blocked at once (further items wait their turn).
/// - `shutdown` drains queued items and joins the workers.
pub trait WorkerExecutor: Send + Sync {
    /// Enqueue one item for execution on some worker thread.
    fn spawn(&self, work: WorkItem);

    /// Number of workers currently executing an item.
    fn active(&self) -> usize;

    /// Total worker threads in the pool.
    fn total(&self) -> usize;

    /// Stop accepting work, drain the queue, join the workers.
    fn shutdown(&self);
}
