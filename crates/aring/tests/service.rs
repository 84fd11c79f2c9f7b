//! End-to-end exercises of the service surface: context lifecycle,
//! submission, reaping, cancellation, teardown, and the shared-memory
//! ring as the caller sees it.

use aring::{
    req_flags, AioError, AioService, CompletionRecord, Dir, DoneFn, IoReq, NativeIo, OpOutcome,
    Opcode, RingHeader, Transfer, COMPAT_BASE, COMPAT_WORKER, RING_MAGIC,
};
use std::ffi::CString;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn read_desc(fd: i32, buf: &mut [u8], offset: i64, data: u64) -> Box<IoReq> {
    let mut d = IoReq::zeroed();
    d.opcode = Opcode::Pread as u16;
    d.fd = fd as u32;
    d.buf = buf.as_mut_ptr() as u64;
    d.nbytes = buf.len() as u64;
    d.offset = offset;
    d.data = data;
    Box::new(d)
}

fn poll_desc(fd: i32, data: u64) -> Box<IoReq> {
    let mut d = IoReq::zeroed();
    d.opcode = Opcode::Poll as u16;
    d.fd = fd as u32;
    d.buf = libc::POLLIN as u64;
    d.data = data;
    Box::new(d)
}

struct Pipe {
    rd: i32,
    wr: i32,
}

impl Pipe {
    fn new() -> Self {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        Self {
            rd: fds[0],
            wr: fds[1],
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rd);
            libc::close(self.wr);
        }
    }
}

fn data_file(len: usize) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    f.write_all(&payload).unwrap();
    f.flush().unwrap();
    f
}

#[test]
fn test_s1_submit_two_reads_reap_two() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(8, &mut handle).unwrap();
    assert_ne!(handle, 0);

    let file = data_file(64);
    let fd = file.as_file().as_raw_fd();
    let mut buf_a = vec![0u8; 16];
    let mut buf_b = vec![0u8; 16];
    let mut da = read_desc(fd, &mut buf_a, 0, 0xAA);
    let mut db = read_desc(fd, &mut buf_b, 16, 0xBB);
    let pa = &mut *da as *mut IoReq;
    let pb = &mut *db as *mut IoReq;

    let n = unsafe { svc.submit(handle, &[pa, pb]) }.unwrap();
    assert_eq!(n, 2);

    let mut out = [CompletionRecord::zeroed(); 2];
    let n = svc.get_events(handle, 2, &mut out, None).unwrap();
    assert_eq!(n, 2);

    for rec in &out {
        let (ptr, cookie, buf) = if rec.obj == pa as u64 {
            (pa, 0xAA, &buf_a)
        } else {
            (pb, 0xBB, &buf_b)
        };
        assert_eq!(rec.obj, ptr as u64);
        assert_eq!(rec.data, cookie);
        assert_eq!(rec.res, 16);
        let off = if cookie == 0xAA { 0 } else { 16 };
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, ((off + i) % 251) as u8);
        }
    }

    svc.destroy(handle).unwrap();
}

#[test]
fn test_header_format() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(8, &mut handle).unwrap();

    let hdr = unsafe { std::ptr::read_volatile(handle as *const RingHeader) };
    assert_eq!(hdr.magic, RING_MAGIC);
    assert_eq!(hdr.id, 0);
    assert!(hdr.nr >= 8);
    assert_eq!(hdr.head, 0);
    assert_eq!(hdr.tail, 0);
    assert_eq!(hdr.compat_features, COMPAT_BASE | COMPAT_WORKER);
    assert_eq!(hdr.incompat_features, 0);
    assert_eq!(
        hdr.header_length as usize,
        std::mem::size_of::<RingHeader>()
    );

    svc.destroy(handle).unwrap();
}

#[test]
fn test_setup_argument_validation() {
    let svc = AioService::new();
    let mut handle = 7u64; // pre-filled: must be rejected
    assert_eq!(svc.setup(8, &mut handle), Err(AioError::InvalidArgument));
    handle = 0;
    assert_eq!(svc.setup(0, &mut handle), Err(AioError::InvalidArgument));
}

#[test]
fn test_s2_admission_exhaustion_try_again() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(1, &mut handle).unwrap();
    let nr = unsafe { std::ptr::read_volatile(handle as *const RingHeader) }.nr as usize;

    let pipe = Pipe::new();
    let mut descs: Vec<Box<IoReq>> = Vec::new();
    let mut submitted = 0usize;
    let mut saw_try_again = false;

    for i in 0..nr * 2 {
        let mut d = poll_desc(pipe.rd, i as u64);
        let p = &mut *d as *mut IoReq;
        descs.push(d);
        match unsafe { svc.submit(handle, &[p]) } {
            Ok(1) => submitted += 1,
            Err(AioError::TryAgain) => {
                saw_try_again = true;
                break;
            }
            other => panic!("unexpected submit outcome: {:?}", other),
        }
    }

    assert!(saw_try_again, "admission never ran out");
    assert!(submitted < nr, "over-admitted past ring capacity");

    // Teardown cancels every parked poll and blocks until each one has
    // published its aborted completion.
    svc.destroy(handle).unwrap();
}

#[test]
fn test_s3_cancel_blocked_poll() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(4, &mut handle).unwrap();

    let pipe = Pipe::new();
    let mut d = poll_desc(pipe.rd, 0xC0FFEE);
    let p = &mut *d as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[p]) }.unwrap(), 1);

    // Let the worker reach the blocking poll at least some of the time.
    std::thread::sleep(Duration::from_millis(10));

    unsafe { svc.cancel(handle, p) }.unwrap();

    let mut out = [CompletionRecord::zeroed(); 1];
    let n = svc.get_events(handle, 1, &mut out, None).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].obj, p as u64);
    assert_eq!(out[0].data, 0xC0FFEE);
    assert_eq!(out[0].res, -(libc::EINTR as i64));

    // Already terminal: a second cancel has nothing to claim.
    assert_eq!(
        unsafe { svc.cancel(handle, p) },
        Err(AioError::InvalidArgument)
    );

    svc.destroy(handle).unwrap();
}

#[test]
fn test_cancel_unknown_descriptor() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(4, &mut handle).unwrap();

    let mut stranger = IoReq::zeroed();
    assert_eq!(
        unsafe { svc.cancel(handle, &mut stranger) },
        Err(AioError::InvalidArgument)
    );
    svc.destroy(handle).unwrap();
}

#[test]
fn test_s4_destroy_then_handle_is_dead() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(2, &mut handle).unwrap();

    // Destroy must also drain an in-flight blocked operation.
    let pipe = Pipe::new();
    let mut d = poll_desc(pipe.rd, 1);
    let p = &mut *d as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[p]) }.unwrap(), 1);

    svc.destroy(handle).unwrap();

    let file = data_file(16);
    let mut buf = [0u8; 8];
    let mut rd = read_desc(file.as_file().as_raw_fd(), &mut buf, 0, 2);
    let rp = &mut *rd as *mut IoReq;
    assert_eq!(
        unsafe { svc.submit(handle, &[rp]) },
        Err(AioError::BadHandle)
    );
    let mut out = [CompletionRecord::zeroed(); 1];
    assert_eq!(
        svc.get_events(handle, 0, &mut out, Some(Duration::ZERO)),
        Err(AioError::BadHandle)
    );
    assert_eq!(svc.destroy(handle), Err(AioError::BadHandle));
}

#[test]
fn test_s5_setup_teardown_cycles() {
    let svc = AioService::new();
    let file = data_file(64);
    let fd = file.as_file().as_raw_fd();

    for round in 0..40 {
        let mut handle = 0u64;
        svc.setup(8, &mut handle).unwrap();

        let mut buf = vec![0u8; 32];
        let mut d = read_desc(fd, &mut buf, 0, round);
        let p = &mut *d as *mut IoReq;
        assert_eq!(unsafe { svc.submit(handle, &[p]) }.unwrap(), 1);

        let mut out = [CompletionRecord::zeroed(); 1];
        assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
        assert_eq!(out[0].res, 32);

        svc.destroy(handle).unwrap();
    }
}

#[test]
fn test_exit_all_sweeps_every_context() {
    let svc = AioService::new();
    let pipe = Pipe::new();

    let mut handles = vec![];
    let mut descs = vec![];
    for i in 0..3 {
        let mut handle = 0u64;
        svc.setup(4, &mut handle).unwrap();
        let mut d = poll_desc(pipe.rd, i);
        let p = &mut *d as *mut IoReq;
        assert_eq!(unsafe { svc.submit(handle, &[p]) }.unwrap(), 1);
        handles.push(handle);
        descs.push(d);
    }

    svc.exit_all();

    for handle in handles {
        let mut out = [CompletionRecord::zeroed(); 1];
        assert_eq!(
            svc.get_events(handle, 0, &mut out, Some(Duration::ZERO)),
            Err(AioError::BadHandle)
        );
    }
}

#[test]
fn test_s6_hostile_head() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(4, &mut handle).unwrap();

    // Caller scribbles an absurd consumer cursor straight into the
    // shared header. Pick a huge raw value that cannot alias a cursor
    // near the real one whatever the ring capacity came out as.
    let nr = unsafe { std::ptr::read_volatile(handle as *const RingHeader) }.nr;
    let hostile = u32::MAX - (u32::MAX % nr) - nr + nr / 2;
    unsafe {
        let head = std::ptr::addr_of_mut!((*(handle as *mut RingHeader)).head);
        std::ptr::write_volatile(head, hostile);
    }

    // Submission keeps functioning.
    let file = data_file(32);
    let mut buf = [0u8; 16];
    let mut d = read_desc(file.as_file().as_raw_fd(), &mut buf, 0, 9);
    let p = &mut *d as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[p]) }.unwrap(), 1);

    // Reaping degrades to zero records, never a fault or fabrication.
    std::thread::sleep(Duration::from_millis(50));
    let mut out = [CompletionRecord::zeroed(); 4];
    assert_eq!(
        svc.get_events(handle, 0, &mut out, Some(Duration::ZERO)).unwrap(),
        0
    );

    svc.destroy(handle).unwrap();
}

#[test]
fn test_no_lost_slot_on_failed_submission() {
    // Failed submissions must not consume admission capacity: two
    // contexts of the same geometry admit the same count even after a
    // burst of failures on one of them.
    let svc = AioService::new();
    let pipe = Pipe::new();

    let fill = |handle: u64, descs: &mut Vec<Box<IoReq>>| -> usize {
        let mut submitted = 0;
        loop {
            let mut d = poll_desc(pipe.rd, submitted as u64);
            let p = &mut *d as *mut IoReq;
            descs.push(d);
            match unsafe { svc.submit(handle, &[p]) } {
                Ok(1) => submitted += 1,
                Err(AioError::TryAgain) => return submitted,
                other => panic!("unexpected: {:?}", other),
            }
        }
    };

    let mut h1 = 0u64;
    svc.setup(1, &mut h1).unwrap();
    let mut descs1 = Vec::new();
    let baseline = fill(h1, &mut descs1);

    let mut h2 = 0u64;
    svc.setup(1, &mut h2).unwrap();
    // Burn failures: a bad descriptor (fd -1) aborts after admission.
    for _ in 0..50 {
        let mut bad = poll_desc(-1, 0);
        let bp = &mut *bad as *mut IoReq;
        assert_eq!(
            unsafe { svc.submit(h2, &[bp]) },
            Err(AioError::BadDescriptor)
        );
    }
    let mut descs2 = Vec::new();
    let after_failures = fill(h2, &mut descs2);

    // Identical geometry must admit the same count, modulo slots a CPU
    // migration can strand in another cell for a while.
    let nr = unsafe { std::ptr::read_volatile(h2 as *const RingHeader) }.nr;
    let ncpu = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4) as u32;
    let batch = ((nr - 1) / (ncpu * 4)).max(1) as i64;
    assert!(
        (after_failures as i64 - baseline as i64).abs() <= 2 * batch,
        "capacity drifted: {} vs {} (batch {})",
        after_failures,
        baseline,
        batch
    );

    svc.destroy(h1).unwrap();
    svc.destroy(h2).unwrap();
}

#[test]
fn test_submit_validation() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(4, &mut handle).unwrap();
    let file = data_file(16);
    let fd = file.as_file().as_raw_fd();

    // Reserved field set.
    let mut buf = [0u8; 8];
    let mut d = read_desc(fd, &mut buf, 0, 0);
    d.reserved1 = 1;
    let p = &mut *d as *mut IoReq;
    assert_eq!(
        unsafe { svc.submit(handle, &[p]) },
        Err(AioError::InvalidArgument)
    );

    // Unknown and reserved opcodes.
    for bad in [4u16, 6, 13, 200] {
        let mut d = read_desc(fd, &mut buf, 0, 0);
        d.opcode = bad;
        let p = &mut *d as *mut IoReq;
        assert_eq!(
            unsafe { svc.submit(handle, &[p]) },
            Err(AioError::InvalidArgument)
        );
    }

    // nbytes that cannot be a signed size.
    let mut d = read_desc(fd, &mut buf, 0, 0);
    d.nbytes = u64::MAX;
    let p = &mut *d as *mut IoReq;
    assert_eq!(
        unsafe { svc.submit(handle, &[p]) },
        Err(AioError::InvalidArgument)
    );

    // Null descriptor pointer.
    assert_eq!(
        unsafe { svc.submit(handle, &[std::ptr::null_mut()]) },
        Err(AioError::BadAddress)
    );

    // Wrong-mode descriptor: reading a write-only fd.
    let wr_only = std::fs::OpenOptions::new()
        .write(true)
        .open(file.path())
        .unwrap();
    let mut d = read_desc(wr_only.as_raw_fd(), &mut buf, 0, 0);
    let p = &mut *d as *mut IoReq;
    assert_eq!(
        unsafe { svc.submit(handle, &[p]) },
        Err(AioError::BadDescriptor)
    );

    // Empty batch is a no-op.
    assert_eq!(unsafe { svc.submit(handle, &[]) }.unwrap(), 0);

    svc.destroy(handle).unwrap();
}

#[test]
fn test_partial_batch_hides_late_failure() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(4, &mut handle).unwrap();
    let file = data_file(32);
    let fd = file.as_file().as_raw_fd();

    let mut buf = [0u8; 16];
    let mut good = read_desc(fd, &mut buf, 0, 1);
    let gp = &mut *good as *mut IoReq;
    let mut bad = read_desc(fd, &mut buf, 0, 2);
    bad.opcode = 4;
    let bp = &mut *bad as *mut IoReq;

    // The batch stops at the bad descriptor but reports the one that
    // made it in; the failure code is hidden behind the count.
    assert_eq!(unsafe { svc.submit(handle, &[gp, bp]) }.unwrap(), 1);

    let mut out = [CompletionRecord::zeroed(); 2];
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    assert_eq!(out[0].obj, gp as u64);

    svc.destroy(handle).unwrap();
}

#[test]
fn test_writev_readv_roundtrip() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(8, &mut handle).unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    let fd = file.as_file().as_raw_fd();

    let part_a = b"scatter-".to_vec();
    let part_b = b"gather".to_vec();
    let wr_iovs = [
        libc::iovec {
            iov_base: part_a.as_ptr() as *mut libc::c_void,
            iov_len: part_a.len(),
        },
        libc::iovec {
            iov_base: part_b.as_ptr() as *mut libc::c_void,
            iov_len: part_b.len(),
        },
    ];
    let mut wd = IoReq::zeroed();
    wd.opcode = Opcode::Pwritev as u16;
    wd.fd = fd as u32;
    wd.buf = wr_iovs.as_ptr() as u64;
    wd.nbytes = 2;
    wd.offset = 0;
    wd.data = 1;
    let wp = &mut wd as *mut IoReq;

    assert_eq!(unsafe { svc.submit(handle, &[wp]) }.unwrap(), 1);
    let mut out = [CompletionRecord::zeroed(); 1];
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    assert_eq!(out[0].res, 14);

    let mut back_a = vec![0u8; 8];
    let mut back_b = vec![0u8; 6];
    let rd_iovs = [
        libc::iovec {
            iov_base: back_a.as_mut_ptr() as *mut libc::c_void,
            iov_len: back_a.len(),
        },
        libc::iovec {
            iov_base: back_b.as_mut_ptr() as *mut libc::c_void,
            iov_len: back_b.len(),
        },
    ];
    let mut rd = IoReq::zeroed();
    rd.opcode = Opcode::Preadv as u16;
    rd.fd = fd as u32;
    rd.buf = rd_iovs.as_ptr() as u64;
    rd.nbytes = 2;
    rd.offset = 0;
    rd.data = 2;
    let rp = &mut rd as *mut IoReq;

    assert_eq!(unsafe { svc.submit(handle, &[rp]) }.unwrap(), 1);
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    assert_eq!(out[0].res, 14);
    assert_eq!(&back_a, b"scatter-");
    assert_eq!(&back_b, b"gather");

    svc.destroy(handle).unwrap();
}

#[test]
fn test_fsync_fdsync_readahead() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(8, &mut handle).unwrap();

    let file = data_file(8192);
    let fd = file.as_file().as_raw_fd();

    let mut fs = IoReq::zeroed();
    fs.opcode = Opcode::Fsync as u16;
    fs.fd = fd as u32;
    fs.data = 1;
    let mut fds = IoReq::zeroed();
    fds.opcode = Opcode::Fdsync as u16;
    fds.fd = fd as u32;
    fds.data = 2;
    let p1 = &mut fs as *mut IoReq;
    let p2 = &mut fds as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[p1, p2]) }.unwrap(), 2);

    let mut out = [CompletionRecord::zeroed(); 2];
    assert_eq!(svc.get_events(handle, 2, &mut out, None).unwrap(), 2);
    for rec in &out {
        assert_eq!(rec.res, 0);
    }

    // In-range readahead reports the bytes it covers; past-EOF is zero.
    let mut ra = IoReq::zeroed();
    ra.opcode = Opcode::Readahead as u16;
    ra.fd = fd as u32;
    ra.nbytes = 4096;
    ra.data = 3;
    let pr = &mut ra as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[pr]) }.unwrap(), 1);
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    assert_eq!(out[0].res, 4096);

    let mut ra2 = IoReq::zeroed();
    ra2.opcode = Opcode::Readahead as u16;
    ra2.fd = fd as u32;
    ra2.nbytes = 100;
    ra2.offset = 100_000;
    ra2.data = 4;
    let pr2 = &mut ra2 as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[pr2]) }.unwrap(), 1);
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    assert_eq!(out[0].res, 0);

    svc.destroy(handle).unwrap();
}

#[test]
fn test_path_ops_openat_renameat_unlinkat() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(8, &mut handle).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let dir_cstr = CString::new(dir.path().to_str().unwrap()).unwrap();
    let dirfd = unsafe { libc::open(dir_cstr.as_ptr(), libc::O_DIRECTORY | libc::O_RDONLY) };
    assert!(dirfd >= 0);

    // OPENAT with O_CREAT: result is the freshly installed fd.
    let name = CString::new("created.txt").unwrap();
    let mut od = IoReq::zeroed();
    od.opcode = Opcode::Openat as u16;
    od.fd = dirfd as u32;
    od.buf = name.as_ptr() as u64;
    od.offset = ((0o644u64 << 32) | (libc::O_CREAT | libc::O_WRONLY) as u32 as u64) as i64;
    od.data = 1;
    let op = &mut od as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[op]) }.unwrap(), 1);

    let mut out = [CompletionRecord::zeroed(); 1];
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    let new_fd = out[0].res;
    assert!(new_fd >= 0, "openat failed: {}", new_fd);
    let payload = b"hello";
    assert_eq!(
        unsafe {
            libc::write(
                new_fd as i32,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        },
        5
    );
    unsafe { libc::close(new_fd as i32) };
    assert!(dir.path().join("created.txt").exists());

    // RENAMEAT via the info block.
    let old = CString::new("created.txt").unwrap();
    let new = CString::new("renamed.txt").unwrap();
    let info = aring::RenameInfo {
        oldpath: old.as_ptr() as u64,
        newpath: new.as_ptr() as u64,
        olddirfd: dirfd,
        newdirfd: dirfd,
        flags: 0,
    };
    let mut rn = IoReq::zeroed();
    rn.opcode = Opcode::Renameat as u16;
    rn.buf = &info as *const aring::RenameInfo as u64;
    rn.nbytes = std::mem::size_of::<aring::RenameInfo>() as u64;
    rn.data = 2;
    let rp = &mut rn as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[rp]) }.unwrap(), 1);
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    assert_eq!(out[0].res, 0);
    assert!(!dir.path().join("created.txt").exists());
    assert!(dir.path().join("renamed.txt").exists());

    // UNLINKAT removes it again.
    let mut ul = IoReq::zeroed();
    ul.opcode = Opcode::Unlinkat as u16;
    ul.fd = dirfd as u32;
    ul.buf = new.as_ptr() as u64;
    ul.data = 3;
    let up = &mut ul as *mut IoReq;
    assert_eq!(unsafe { svc.submit(handle, &[up]) }.unwrap(), 1);
    assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
    assert_eq!(out[0].res, 0);
    assert!(!dir.path().join("renamed.txt").exists());

    unsafe { libc::close(dirfd) };
    svc.destroy(handle).unwrap();
}

#[test]
fn test_eventfd_ticks_per_completion() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(8, &mut handle).unwrap();

    let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    assert!(efd >= 0);

    let file = data_file(64);
    let fd = file.as_file().as_raw_fd();
    let mut buf_a = vec![0u8; 16];
    let mut buf_b = vec![0u8; 16];
    let mut da = read_desc(fd, &mut buf_a, 0, 1);
    da.flags = req_flags::RESFD;
    da.resfd = efd as u32;
    let mut db = read_desc(fd, &mut buf_b, 16, 2);
    db.flags = req_flags::RESFD;
    db.resfd = efd as u32;
    let pa = &mut *da as *mut IoReq;
    let pb = &mut *db as *mut IoReq;

    assert_eq!(unsafe { svc.submit(handle, &[pa, pb]) }.unwrap(), 2);
    let mut out = [CompletionRecord::zeroed(); 2];
    assert_eq!(svc.get_events(handle, 2, &mut out, None).unwrap(), 2);

    let mut count = 0u64;
    let rc = unsafe {
        libc::read(
            efd,
            &mut count as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    assert_eq!(rc, 8);
    assert_eq!(count, 2, "one eventfd increment per completion");

    // A bogus notifier fd is a per-descriptor failure.
    let mut bad = read_desc(fd, &mut buf_a, 0, 3);
    bad.flags = req_flags::RESFD;
    bad.resfd = u32::MAX;
    let bp = &mut *bad as *mut IoReq;
    assert_eq!(
        unsafe { svc.submit(handle, &[bp]) },
        Err(AioError::BadDescriptor)
    );

    unsafe { libc::close(efd) };
    svc.destroy(handle).unwrap();
}

#[test]
fn test_get_events_bounded_wait() {
    let svc = AioService::new();
    let mut handle = 0u64;
    svc.setup(4, &mut handle).unwrap();

    let mut out = [CompletionRecord::zeroed(); 2];
    let t0 = std::time::Instant::now();
    assert_eq!(
        svc.get_events(handle, 1, &mut out, Some(Duration::from_millis(50)))
            .unwrap(),
        0
    );
    assert!(t0.elapsed() >= Duration::from_millis(40));

    // min greater than the buffer is malformed.
    assert_eq!(
        svc.get_events(handle, 3, &mut out, None),
        Err(AioError::InvalidArgument)
    );

    svc.destroy(handle).unwrap();
}

// ── native backend wiring ──

/// Completes synchronously: the dispatcher publishes the returned value.
struct SyncNative {
    calls: AtomicUsize,
}

impl NativeIo for SyncNative {
    fn supports(&self, opcode: Opcode) -> bool {
        opcode == Opcode::Pread
    }

    fn start(&self, xfer: Transfer, _done: DoneFn) -> aring::Result<OpOutcome> {
        assert_eq!(xfer.dir, Dir::Read);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OpOutcome::Done(xfer.len() as i64))
    }
}

/// Completes from another thread, the way a real engine would.
struct QueuedNative {
    calls: AtomicUsize,
}

impl NativeIo for QueuedNative {
    fn supports(&self, opcode: Opcode) -> bool {
        opcode == Opcode::Pread
    }

    fn start(&self, xfer: Transfer, done: DoneFn) -> aring::Result<OpOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            done(xfer.len() as i64, 0);
        });
        Ok(OpOutcome::Queued)
    }
}

#[test]
fn test_native_backend_sync_and_queued() {
    for queued in [false, true] {
        let sync = Arc::new(SyncNative {
            calls: AtomicUsize::new(0),
        });
        let q = Arc::new(QueuedNative {
            calls: AtomicUsize::new(0),
        });
        let svc = if queued {
            let backend: Arc<dyn NativeIo> = q.clone();
            AioService::builder().native(backend).build()
        } else {
            let backend: Arc<dyn NativeIo> = sync.clone();
            AioService::builder().native(backend).build()
        };

        let mut handle = 0u64;
        svc.setup(4, &mut handle).unwrap();
        let file = data_file(32);
        let fd = file.as_file().as_raw_fd();

        let mut buf = vec![0u8; 24];
        let mut d = read_desc(fd, &mut buf, 0, 5);
        let p = &mut *d as *mut IoReq;
        assert_eq!(unsafe { svc.submit(handle, &[p]) }.unwrap(), 1);

        let mut out = [CompletionRecord::zeroed(); 1];
        assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
        assert_eq!(out[0].res, 24);
        assert_eq!(out[0].obj, p as u64);

        if queued {
            assert_eq!(q.calls.load(Ordering::SeqCst), 1);
        } else {
            assert_eq!(sync.calls.load(Ordering::SeqCst), 1);
        }

        // Writes are not claimed by either backend: the worker path
        // still serves them.
        let payload = b"fallback".to_vec();
        let mut wd = IoReq::zeroed();
        wd.opcode = Opcode::Pwrite as u16;
        wd.fd = fd as u32;
        wd.buf = payload.as_ptr() as u64;
        wd.nbytes = payload.len() as u64;
        wd.offset = 0;
        wd.data = 6;
        let wp = &mut wd as *mut IoReq;
        assert_eq!(unsafe { svc.submit(handle, &[wp]) }.unwrap(), 1);
        assert_eq!(svc.get_events(handle, 1, &mut out, None).unwrap(), 1);
        assert_eq!(out[0].res, 8);

        svc.destroy(handle).unwrap();
    }
}

#[test]
fn test_worker_disabled_rejects_fallback_ops() {
    let svc = AioService::builder()
        .worker_enabled(false)
        .worker_threads(1)
        .build();
    let mut handle = 0u64;
    svc.setup(4, &mut handle).unwrap();

    // Header honestly reports the missing capability.
    let hdr = unsafe { std::ptr::read_volatile(handle as *const RingHeader) };
    assert_eq!(hdr.compat_features & COMPAT_WORKER, 0);

    let file = data_file(16);
    let mut buf = [0u8; 8];
    let mut d = read_desc(file.as_file().as_raw_fd(), &mut buf, 0, 1);
    let p = &mut *d as *mut IoReq;
    assert_eq!(
        unsafe { svc.submit(handle, &[p]) },
        Err(AioError::InvalidArgument)
    );

    svc.destroy(handle).unwrap();
}
