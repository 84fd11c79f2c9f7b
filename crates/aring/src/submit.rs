//! Submission dispatch: the opcode table and the submit-one path.
//!
//! A descriptor travels: validate → reserve an admission slot →
//! prepare the opcode payload (iovec import, path copy, clamping) →
//! allocate the request → route. Data transfers go to the native
//! backend when one is installed and claims the opcode; everything
//! else — and transfers without a native path — queues to the worker
//! pool with the two-stage cancel protocol armed.
//!
//! Outcome protocol: `Queued` means the operation owns the request and
//! will call `complete()`; `Done(res)` means the dispatcher publishes
//! the result itself; an error before queueing unwinds the admission
//! slot and the request and aborts the batch.
//!
//! Worker cancellation is two-stage. While queued, the installed
//! handler is a no-op stub — the terminal CAS alone marks the request,
//! and the worker notices at its early→late switch. Once a worker is
//! assigned, the handler interrupts it with a signal, bouncing the
//! blocked syscall out with EINTR. The switch and the terminal CAS
//! race; the loser yields.

use crate::context::AioContext;
use crate::request::{AioRequest, OpKind, SgList};
use crate::worker;
use aring_core::backend::{Dir, DoneFn, IoVec, OpOutcome, Transfer};
use aring_core::entry::{req_flags, IoReq, Opcode, RenameInfo, REQ_KEY};
use aring_core::error::{AioError, Result};
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

struct SubmitInfo {
    op: Opcode,
    needs_fd: bool,
    prep: fn(&IoReq) -> Result<OpKind>,
}

const SUBMIT_INFO: [Option<SubmitInfo>; 13] = [
    Some(SubmitInfo { op: Opcode::Pread, needs_fd: true, prep: prep_pread }),
    Some(SubmitInfo { op: Opcode::Pwrite, needs_fd: true, prep: prep_pwrite }),
    Some(SubmitInfo { op: Opcode::Fsync, needs_fd: true, prep: prep_fsync }),
    Some(SubmitInfo { op: Opcode::Fdsync, needs_fd: true, prep: prep_fdsync }),
    None,
    Some(SubmitInfo { op: Opcode::Poll, needs_fd: true, prep: prep_poll }),
    None,
    Some(SubmitInfo { op: Opcode::Preadv, needs_fd: true, prep: prep_preadv }),
    Some(SubmitInfo { op: Opcode::Pwritev, needs_fd: true, prep: prep_pwritev }),
    Some(SubmitInfo { op: Opcode::Openat, needs_fd: false, prep: prep_openat }),
    Some(SubmitInfo { op: Opcode::Unlinkat, needs_fd: false, prep: prep_unlinkat }),
    Some(SubmitInfo { op: Opcode::Renameat, needs_fd: false, prep: prep_renameat }),
    Some(SubmitInfo { op: Opcode::Readahead, needs_fd: true, prep: prep_readahead }),
];

// ── per-opcode preparation ──

fn prep_pread(iocb: &IoReq) -> Result<OpKind> {
    Ok(OpKind::Rw {
        write: false,
        sg: SgList::single(iocb.buf, iocb.nbytes),
        offset: iocb.offset,
    })
}

fn prep_pwrite(iocb: &IoReq) -> Result<OpKind> {
    Ok(OpKind::Rw {
        write: true,
        sg: SgList::single(iocb.buf, iocb.nbytes),
        offset: iocb.offset,
    })
}

fn prep_preadv(iocb: &IoReq) -> Result<OpKind> {
    let sg = unsafe { SgList::import(iocb.buf as *const libc::iovec, iocb.nbytes as usize)? };
    Ok(OpKind::Rw {
        write: false,
        sg,
        offset: iocb.offset,
    })
}

fn prep_pwritev(iocb: &IoReq) -> Result<OpKind> {
    let sg = unsafe { SgList::import(iocb.buf as *const libc::iovec, iocb.nbytes as usize)? };
    Ok(OpKind::Rw {
        write: true,
        sg,
        offset: iocb.offset,
    })
}

fn prep_fsync(_iocb: &IoReq) -> Result<OpKind> {
    Ok(OpKind::Fsync { datasync: false })
}

fn prep_fdsync(_iocb: &IoReq) -> Result<OpKind> {
    Ok(OpKind::Fsync { datasync: true })
}

fn prep_poll(iocb: &IoReq) -> Result<OpKind> {
    // The mask must fit the pollfd events field.
    if iocb.buf as u16 as u64 != iocb.buf {
        return Err(AioError::InvalidArgument);
    }
    Ok(OpKind::Poll {
        events: iocb.buf as u16 as i16,
    })
}

fn copy_user_path(ptr: u64) -> Result<CString> {
    if ptr == 0 {
        return Err(AioError::BadAddress);
    }
    let s = unsafe { CStr::from_ptr(ptr as *const libc::c_char) };
    if s.to_bytes().len() >= libc::PATH_MAX as usize {
        return Err(AioError::Os(libc::ENAMETOOLONG));
    }
    Ok(s.to_owned())
}

fn prep_openat(iocb: &IoReq) -> Result<OpKind> {
    // flags in the low half of offset, mode in the high half.
    let flags = iocb.offset as u32 as i32 | libc::O_LARGEFILE;
    let mode = (iocb.offset as u64 >> 32) as libc::mode_t;
    Ok(OpKind::OpenAt {
        dir_fd: iocb.fd as i32,
        path: copy_user_path(iocb.buf)?,
        flags,
        mode,
    })
}

fn prep_unlinkat(iocb: &IoReq) -> Result<OpKind> {
    if iocb.offset != 0 {
        return Err(AioError::InvalidArgument);
    }
    Ok(OpKind::UnlinkAt {
        dir_fd: iocb.fd as i32,
        path: copy_user_path(iocb.buf)?,
    })
}

fn prep_renameat(iocb: &IoReq) -> Result<OpKind> {
    if iocb.nbytes != std::mem::size_of::<RenameInfo>() as u64 || iocb.offset != 0 {
        return Err(AioError::InvalidArgument);
    }
    if iocb.buf == 0 {
        return Err(AioError::BadAddress);
    }
    let info = unsafe { ptr::read_volatile(iocb.buf as *const RenameInfo) };
    Ok(OpKind::RenameAt {
        old_dir: info.olddirfd,
        old: copy_user_path(info.oldpath)?,
        new_dir: info.newdirfd,
        new: copy_user_path(info.newpath)?,
        flags: info.flags,
    })
}

fn prep_readahead(iocb: &IoReq) -> Result<OpKind> {
    if iocb.buf != 0 {
        return Err(AioError::InvalidArgument);
    }
    let mut len = iocb.nbytes;
    if len > 0 {
        let end = iocb
            .offset
            .checked_add(len as i64)
            .ok_or(AioError::InvalidArgument)?;
        if end < 0 {
            return Err(AioError::InvalidArgument);
        }
        // Clamp to the file size; past-EOF readahead completes with 0.
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat64(iocb.fd as i32, &mut st) } < 0 {
            return Err(AioError::BadDescriptor);
        }
        if st.st_size < end {
            len = (st.st_size - iocb.offset).max(0) as u64;
        }
    }
    Ok(OpKind::Readahead {
        offset: iocb.offset,
        len,
    })
}

// ── submit-one ──

/// Validate one copied descriptor, admit it, build the request and
/// start the operation.
///
/// # Safety
/// `user_iocb` must point at the live descriptor `iocb` was copied
/// from; the key field is written back through it, and buffer/iovec
/// pointers inside must stay valid until the completion is published.
pub(crate) unsafe fn submit_one(
    ctx: &Arc<AioContext>,
    user_iocb: *mut IoReq,
    iocb: &IoReq,
) -> Result<()> {
    // Forward compatibility: reserved fields must be clear.
    if iocb.reserved1 != 0 || iocb.reserved2 != 0 {
        log::debug!("submit: reserved field set");
        return Err(AioError::InvalidArgument);
    }
    // Overflow checks before anything is narrowed.
    if iocb.buf > usize::MAX as u64
        || iocb.nbytes > usize::MAX as u64
        || (iocb.nbytes as i64) < 0
    {
        return Err(AioError::InvalidArgument);
    }

    let info = SUBMIT_INFO
        .get(iocb.opcode as usize)
        .and_then(|e| e.as_ref())
        .ok_or(AioError::InvalidArgument)?;

    if !ctx.reserve_slot() {
        return Err(AioError::TryAgain);
    }
    ctx.reqs_get();

    let built = (|| -> Result<Arc<AioRequest>> {
        let fd = iocb.fd as i32;
        if info.needs_fd {
            check_fd_mode(fd, info.op)?;
        }
        let op = (info.prep)(iocb)?;
        let eventfd = if iocb.flags & req_flags::RESFD != 0 {
            Some(crate::notify::EventFd::from_raw(iocb.resfd as i32)?)
        } else {
            None
        };
        Ok(AioRequest::new(
            Arc::clone(ctx),
            info.op,
            user_iocb as u64,
            iocb.data,
            fd,
            op,
            eventfd,
        ))
    })();

    let req = match built {
        Ok(req) => req,
        Err(e) => {
            ctx.release_slot(1);
            ctx.reqs_put();
            return Err(e);
        }
    };

    // The opaque key the cancellation path checks later.
    ptr::write_volatile(ptr::addr_of_mut!((*user_iocb).key), REQ_KEY);

    match start(&req) {
        Ok(OpOutcome::Queued) => Ok(()),
        Ok(OpOutcome::Done(res)) => {
            req.complete(res, 0);
            Ok(())
        }
        Err(e) => {
            ctx.release_slot(1);
            ctx.reqs_put();
            Err(e)
        }
    }
}

fn check_fd_mode(fd: i32, op: Opcode) -> Result<()> {
    let fl = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if fl < 0 {
        return Err(AioError::BadDescriptor);
    }
    let acc = fl & libc::O_ACCMODE;
    match op {
        Opcode::Pread | Opcode::Preadv => {
            if acc == libc::O_WRONLY {
                return Err(AioError::BadDescriptor);
            }
        }
        Opcode::Pwrite | Opcode::Pwritev => {
            if acc == libc::O_RDONLY {
                return Err(AioError::BadDescriptor);
            }
        }
        _ => {}
    }
    Ok(())
}

// ── routing ──

fn start(req: &Arc<AioRequest>) -> Result<OpOutcome> {
    match req.op() {
        OpKind::Rw { write, sg, offset } => {
            let shared = req.ctx().shared();
            if let Some(native) = &shared.native {
                if native.supports(req.opcode()) {
                    let iovs = sg
                        .as_slice()
                        .iter()
                        .map(|v| IoVec {
                            base: v.iov_base as u64,
                            len: v.iov_len as u64,
                        })
                        .collect();
                    let xfer = Transfer {
                        dir: if *write { Dir::Write } else { Dir::Read },
                        fd: req.fd(),
                        iovs,
                        offset: *offset,
                    };
                    let done: DoneFn = {
                        let req = Arc::clone(req);
                        Box::new(move |res, res2| req.complete(res, res2))
                    };
                    return native.start(xfer, done);
                }
            }
            queue_to_worker(req)
        }
        OpKind::Readahead { len, .. } => {
            if *len == 0 {
                return Ok(OpOutcome::Done(0));
            }
            queue_to_worker(req)
        }
        _ => queue_to_worker(req),
    }
}

// ── worker fallback ──

fn queue_to_worker(req: &Arc<AioRequest>) -> Result<OpOutcome> {
    let shared = req.ctx().shared();
    if !shared.config.worker_enabled {
        return Err(AioError::InvalidArgument);
    }

    // Arm stage one before the work item can race us: from here the
    // request is linked and cancellable.
    req.set_cancel(cancel_early);

    let work = {
        let req = Arc::clone(req);
        Box::new(move || worker_exec(req))
    };
    shared.pool.spawn(work);
    Ok(OpOutcome::Queued)
}

/// Stage one: nothing to interrupt yet. The terminal CAS performed by
/// `cancel_request` is itself the mark; the worker sees it at the
/// switch and completes with -EINTR without executing.
fn cancel_early(_req: &AioRequest) -> i32 {
    0
}

/// Stage two: the request is on a worker; bounce it out of the
/// blocking syscall.
fn cancel_late(req: &AioRequest) -> i32 {
    let task = req.worker_task();
    if task != 0 && worker::interrupt_worker(task) {
        0
    } else {
        -libc::EAGAIN
    }
}

fn worker_exec(req: Arc<AioRequest>) {
    req.set_worker_task(unsafe { libc::pthread_self() } as u64);

    let res = if req.cancel_slot().switch(cancel_early, cancel_late) {
        let mut res = execute(&req);
        // A stray interrupt aimed at a neighbouring request must not
        // cancel this one: retry EINTR unless *our* word went terminal.
        while res == -(libc::EINTR as i64) && !req.cancel_slot().is_terminal() {
            res = execute(&req);
        }
        res
    } else {
        // Cancelled while queued.
        -(libc::EINTR as i64)
    };

    req.set_worker_task(0);
    req.complete(res, 0);
}

#[inline]
fn sys_result(rc: i64) -> i64 {
    if rc < 0 {
        -(unsafe { *libc::__errno_location() } as i64)
    } else {
        rc
    }
}

/// Execute a fallback operation. Runs on a worker thread and MAY block;
/// that is the point. Results use the negative-errno convention.
fn execute(req: &AioRequest) -> i64 {
    match req.op() {
        OpKind::Rw { write, sg, offset } => {
            let iov = sg.as_slice();
            let rc = if *write {
                unsafe {
                    libc::pwritev64(req.fd(), iov.as_ptr(), iov.len() as libc::c_int, *offset)
                }
            } else {
                unsafe {
                    libc::preadv64(req.fd(), iov.as_ptr(), iov.len() as libc::c_int, *offset)
                }
            };
            sys_result(rc as i64)
        }
        OpKind::Fsync { datasync } => {
            let rc = if *datasync {
                unsafe { libc::fdatasync(req.fd()) }
            } else {
                unsafe { libc::fsync(req.fd()) }
            };
            sys_result(rc as i64)
        }
        OpKind::Poll { events } => {
            let wanted = *events | libc::POLLERR | libc::POLLHUP;
            let mut pfd = libc::pollfd {
                fd: req.fd(),
                events: wanted,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rc < 0 {
                sys_result(-1)
            } else {
                (pfd.revents & wanted) as u16 as i64
            }
        }
        OpKind::OpenAt {
            dir_fd,
            path,
            flags,
            mode,
        } => {
            let rc = unsafe {
                libc::openat(*dir_fd, path.as_ptr(), *flags, *mode as libc::c_uint)
            };
            sys_result(rc as i64)
        }
        OpKind::UnlinkAt { dir_fd, path } => {
            let rc = unsafe { libc::unlinkat(*dir_fd, path.as_ptr(), 0) };
            sys_result(rc as i64)
        }
        OpKind::RenameAt {
            old_dir,
            old,
            new_dir,
            new,
            flags,
        } => {
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_renameat2,
                    *old_dir,
                    old.as_ptr(),
                    *new_dir,
                    new.as_ptr(),
                    *flags,
                )
            };
            sys_result(rc as i64)
        }
        OpKind::Readahead { offset, len } => {
            let rc = unsafe { libc::readahead(req.fd(), *offset, *len as libc::size_t) };
            if rc < 0 {
                sys_result(-1)
            } else {
                *len as i64
            }
        }
    }
}
