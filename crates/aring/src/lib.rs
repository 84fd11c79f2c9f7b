//! # aring — an asynchronous I/O ring service
//!
//! Callers submit batches of request descriptors through an opaque
//! handle, operations execute on a native backend or a worker pool,
//! and completions land in a memory-mapped ring the caller reaps
//! without further service calls. One request's life:
//!
//! ```text
//! submit(handle, [desc, ...])
//!     │ validate descriptor, reserve an admission slot
//!     │ build the request, link for cancellation
//!     ├─ native backend? ──► backend completes ─┐
//!     └─ worker pool ─────► worker completes ───┤
//!                                               ▼
//!                    record written to the shared ring, tail advances,
//!                    eventfd ticks, blocked reapers wake
//!     get_events(handle, min, out, timeout) ──► records copied out,
//!                    head advances, slots recycle to admission
//! ```
//!
//! Teardown (`destroy` / `exit_all`) cancels everything outstanding and
//! blocks until the last request finalizes; the ring pages outlive the
//! final completion and not a syscall longer.
//!
//! The [`service::AioService`] type is the entry point; everything else
//! hangs off the handle it issues.

pub mod admission;
pub mod context;
pub mod notify;
pub mod park;
pub mod registry;
pub mod request;
pub mod ring;
pub mod service;
pub mod worker;

mod submit;

pub use aring_core::backend::{Dir, DoneFn, IoVec, NativeIo, OpOutcome, Transfer};
pub use aring_core::entry::{
    req_flags, CompletionRecord, IoReq, Opcode, RenameInfo, RingHeader, COMPAT_BASE,
    COMPAT_WORKER, REQ_KEY, RING_MAGIC,
};
pub use aring_core::error::{AioError, Result};
pub use aring_core::executor::{WorkItem, WorkerExecutor};
pub use service::{AioConfig, AioService, ServiceBuilder};
