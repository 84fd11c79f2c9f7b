//! Native asynchronous I/O backend seam.
//!
//! A [`NativeIo`] is the collaborating filesystem's own asynchronous
//! data path. When installed, READ/WRITE family opcodes are offered to
//! it before falling back to the worker pool; the backend signals
//! completion by invoking the `done` callback the dispatcher hands it,
//! which publishes into the completion ring.
//!
//! # Implementors
//!
//! - Production: an io_uring- or device-backed engine that starts the
//!   transfer and invokes `done` from its own completion context.
//! - Tests: a mock that invokes `done` inline (synchronous) or from a
//!   spawned thread (queued).

use crate::entry::Opcode;
use crate::error::Result;
use std::os::unix::io::RawFd;

/// Completion callback handed to a backend. Must be invoked exactly
/// once with `(res, res2)`; `res` is bytes transferred or a negative
/// errno. May be invoked from any thread.
pub type DoneFn = Box<dyn FnOnce(i64, i64) + Send>;

/// What an opcode function (or a backend) reports back to the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// The operation owns the request and will complete it later.
    Queued,
    /// The result is already known; the dispatcher publishes it.
    Done(i64),
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
}

/// One scatter-gather segment in caller memory.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}

/// A data transfer handed to a native backend. The segments point into
/// caller memory and stay valid until `done` is invoked.
#[derive(Debug)]
pub struct Transfer {
    pub dir: Dir,
    pub fd: RawFd,
    pub iovs: Vec<IoVec>,
    pub offset: i64,
}

impl Transfer {
    /// Total byte count across all segments.
    pub fn len(&self) -> u64 {
        self.iovs.iter().map(|v| v.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Asynchronous transfer submission.
///
/// **Contract:** `start` must not block on the transfer itself. It
/// either takes ownership (`Queued`, `done` fires later, exactly once),
/// finishes immediately (`Done(res)`, `done` must NOT be invoked), or
/// fails before queueing (`Err`, `done` must NOT be invoked — the
/// dispatcher unwinds the request).
pub trait NativeIo: Send + Sync {
    /// Whether this backend offers a native path for `opcode`.
    /// Consulted per submission; only the READ/WRITE family is offered.
    fn supports(&self, opcode: Opcode) -> bool;

    /// Begin the transfer.
    fn start(&self, xfer: Transfer, done: DoneFn) -> Result<OpOutcome>;
}
