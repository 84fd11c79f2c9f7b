//! In-flight request objects and cancellation arbitration.
//!
//! Every accepted descriptor becomes one [`AioRequest`] holding the
//! caller echoes (descriptor pointer, cookie), the prepared operation
//! payload, and the cancellation word. The word is a single atomic:
//!
//! - `0` — no cancel handler installed; cancellation fails.
//! - `usize::MAX` — terminal: the request was cancelled or completed.
//! - anything else — an installed `fn(&AioRequest) -> i32` handler.
//!
//! Transitions into the terminal state happen only by compare-and-swap
//! or swap, so cancellation and completion race safely: the first to
//! reach the sentinel wins and the other side is a no-op. A request is
//! completed exactly once, by whichever of the submission path, the
//! operation, or the worker observes the result first.

use crate::context::AioContext;
use crate::notify::EventFd;
use aring_core::entry::Opcode;
use aring_core::error::{AioError, Result};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Inline scatter-gather capacity; imports beyond this spill to the heap.
pub const INLINE_IOVS: usize = 8;

/// Hard cap on an imported iovec array.
pub const MAX_IOVS: usize = libc::UIO_MAXIOV as usize;

/// A cancel handler. Returns 0 when the interrupt was delivered, a
/// negative errno otherwise; the request's real result still arrives
/// through its completion.
pub type CancelFn = fn(&AioRequest) -> i32;

const UNINSTALLED: usize = 0;
const CANCELLED: usize = usize::MAX;

/// The cancellation word.
pub struct CancelSlot(AtomicUsize);

impl CancelSlot {
    pub fn new() -> Self {
        Self(AtomicUsize::new(UNINSTALLED))
    }

    /// Publish a handler. The caller holds the context lock and has
    /// linked the request into the active list.
    pub fn install(&self, f: CancelFn) {
        self.0.store(f as usize, Ordering::Release);
    }

    /// Claim the request for cancellation: transition whatever handler
    /// is installed to the terminal sentinel and hand it back. `None`
    /// when no handler was installed or the request is already
    /// terminal — either way this caller must not act.
    pub fn take_for_cancel(&self) -> Option<CancelFn> {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            if cur == UNINSTALLED || cur == CANCELLED {
                return None;
            }
            match self
                .0
                .compare_exchange(cur, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => return Some(unsafe { std::mem::transmute::<usize, CancelFn>(prev) }),
                Err(now) => cur = now,
            }
        }
    }

    /// The worker's early→late handler switch at assignment time.
    /// `false` means the request was cancelled before assignment and
    /// must not execute.
    pub fn switch(&self, from: CancelFn, to: CancelFn) -> bool {
        match self.0.compare_exchange(
            from as usize,
            to as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(cur) => {
                debug_assert_eq!(cur, CANCELLED);
                false
            }
        }
    }

    /// Terminal transition from the completion path. Idempotent with
    /// [`take_for_cancel`](Self::take_for_cancel).
    pub fn finish(&self) {
        self.0.swap(CANCELLED, Ordering::AcqRel);
    }

    pub fn is_terminal(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }
}

impl Default for CancelSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Imported scatter-gather state: inline array for small imports, heap
/// beyond [`INLINE_IOVS`] entries.
pub enum SgList {
    Inline {
        vecs: [libc::iovec; INLINE_IOVS],
        len: usize,
    },
    Heap(Vec<libc::iovec>),
}

impl SgList {
    fn empty_vec() -> libc::iovec {
        libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }
    }

    /// One segment over a plain buffer.
    pub fn single(base: u64, len: u64) -> Self {
        let mut vecs = [Self::empty_vec(); INLINE_IOVS];
        vecs[0] = libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: len as usize,
        };
        Self::Inline { vecs, len: 1 }
    }

    /// Copy a caller iovec array in. Total length overflow and
    /// oversized arrays are rejected here, not at execution time.
    ///
    /// # Safety
    /// `ptr` must point at `count` readable `iovec`s.
    pub unsafe fn import(ptr: *const libc::iovec, count: usize) -> Result<Self> {
        if count > MAX_IOVS {
            return Err(AioError::InvalidArgument);
        }
        if count > 0 && ptr.is_null() {
            return Err(AioError::BadAddress);
        }
        let mut list = if count <= INLINE_IOVS {
            Self::Inline {
                vecs: [Self::empty_vec(); INLINE_IOVS],
                len: count,
            }
        } else {
            Self::Heap(vec![Self::empty_vec(); count])
        };
        let dst = match &mut list {
            Self::Inline { vecs, .. } => vecs.as_mut_ptr(),
            Self::Heap(v) => v.as_mut_ptr(),
        };
        std::ptr::copy_nonoverlapping(ptr, dst, count);

        let mut total: u64 = 0;
        for iov in list.as_slice() {
            total = total
                .checked_add(iov.iov_len as u64)
                .filter(|t| *t <= i64::MAX as u64)
                .ok_or(AioError::InvalidArgument)?;
        }
        Ok(list)
    }

    pub fn as_slice(&self) -> &[libc::iovec] {
        match self {
            Self::Inline { vecs, len } => &vecs[..*len],
            Self::Heap(v) => v,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.as_slice().iter().map(|v| v.iov_len as u64).sum()
    }
}

/// The prepared operation payload, built during submission from the
/// descriptor. Paths and rename parameters are copied out of caller
/// memory up front so workers never chase caller pointers for
/// metadata; data buffers stay caller-owned.
pub enum OpKind {
    Rw {
        write: bool,
        sg: SgList,
        offset: i64,
    },
    Fsync {
        datasync: bool,
    },
    Poll {
        events: i16,
    },
    OpenAt {
        dir_fd: RawFd,
        path: CString,
        flags: i32,
        mode: libc::mode_t,
    },
    UnlinkAt {
        dir_fd: RawFd,
        path: CString,
    },
    RenameAt {
        old_dir: RawFd,
        old: CString,
        new_dir: RawFd,
        new: CString,
        flags: u32,
    },
    Readahead {
        offset: i64,
        len: u64,
    },
}

/// One in-flight request.
pub struct AioRequest {
    ctx: Arc<AioContext>,
    opcode: Opcode,
    /// Caller's descriptor address, echoed as the completion's `obj`
    /// and matched on cancellation lookup.
    user_iocb: u64,
    /// Caller cookie, echoed as the completion's `data`.
    user_data: u64,
    /// Resolved descriptor for fd-based operations, -1 otherwise.
    fd: RawFd,
    op: OpKind,
    cancel: CancelSlot,
    /// Active-list membership; mutated only under the context lock.
    linked: AtomicBool,
    eventfd: Option<EventFd>,
    /// pthread of the worker executing this request; 0 before
    /// assignment and after completion. Target of late-stage cancel.
    worker_task: AtomicU64,
}

// The payload carries raw caller pointers (buffers, iovec bases) across
// threads; their validity for the life of the request is the submit
// contract. Same precedent as buffer handles in the executor seams.
unsafe impl Send for AioRequest {}
unsafe impl Sync for AioRequest {}

impl AioRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<AioContext>,
        opcode: Opcode,
        user_iocb: u64,
        user_data: u64,
        fd: RawFd,
        op: OpKind,
        eventfd: Option<EventFd>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            opcode,
            user_iocb,
            user_data,
            fd,
            op,
            cancel: CancelSlot::new(),
            linked: AtomicBool::new(false),
            eventfd,
            worker_task: AtomicU64::new(0),
        })
    }

    pub fn ctx(&self) -> &Arc<AioContext> {
        &self.ctx
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn user_iocb(&self) -> u64 {
        self.user_iocb
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn op(&self) -> &OpKind {
        &self.op
    }

    pub(crate) fn cancel_slot(&self) -> &CancelSlot {
        &self.cancel
    }

    pub(crate) fn linked_flag(&self) -> &AtomicBool {
        &self.linked
    }

    pub(crate) fn set_worker_task(&self, task: u64) {
        self.worker_task.store(task, Ordering::Release);
    }

    pub(crate) fn worker_task(&self) -> u64 {
        self.worker_task.load(Ordering::Acquire)
    }

    /// Install a cancel handler, linking the request into the context's
    /// active list on first install.
    pub(crate) fn set_cancel(self: &Arc<Self>, f: CancelFn) {
        self.ctx.link_and_install(self, f);
    }

    /// Initiate cancellation. The winner of the terminal transition
    /// invokes the installed handler exactly once; everyone else gets
    /// "not cancellable".
    pub fn cancel(self: &Arc<Self>) -> Result<()> {
        match self.cancel.take_for_cancel() {
            Some(f) => {
                let rc = f(self);
                log::debug!(
                    "cancel {:?} iocb={:#x} rc={}",
                    self.opcode,
                    self.user_iocb,
                    rc
                );
                Ok(())
            }
            None => Err(AioError::InvalidArgument),
        }
    }

    /// Publish the result and retire the request. Runs exactly once
    /// per request, from whichever path learned the result.
    pub fn complete(self: &Arc<Self>, res: i64, res2: i64) {
        // Settle the race with cancellation first: after this point a
        // concurrent cancel is a guaranteed no-op.
        self.cancel.finish();

        self.ctx.unlink_request(self);
        self.ctx.publish(self.user_iocb, self.user_data, res, res2);

        if let Some(efd) = &self.eventfd {
            let _ = efd.signal();
        }

        self.ctx.wake_reapers();
        self.ctx.reqs_put();
    }
}
