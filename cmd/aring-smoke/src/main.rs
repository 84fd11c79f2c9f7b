//! aring End-to-End Smoke Test
//!
//! Exercises the full service stack without any test harness:
//!   Part A — context lifecycle: setup, header sanity, destroy
//!   Part B — data path: pwrite/pread through the worker pool
//!   Part C — cancellation: blocked poll cancelled, aborted completion
//!   Part D — teardown: destroy drains a loaded context
//!
//! Run: ./target/release/aring-smoke

use aring::{AioError, AioService, CompletionRecord, IoReq, Opcode, RingHeader, RING_MAGIC};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

const LINE: &str = "────────────────────────────────────────────────────────────";

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

impl TestRunner {
    fn new() -> Self {
        Self {
            total: 0,
            passed: 0,
            failed: 0,
        }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        self.total += 1;
        if ok {
            self.passed += 1;
            println!("  [{:2}] {:<52} PASS", self.total, name);
        } else {
            self.failed += 1;
            println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
        }
    }

    fn summary(&self) -> i32 {
        println!("\n{}", LINE);
        println!(
            "  {} total, {} passed, {} failed",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
        if self.failed == 0 {
            0
        } else {
            1
        }
    }
}

fn desc(opcode: Opcode, fd: i32, buf: u64, nbytes: u64, offset: i64, data: u64) -> IoReq {
    let mut d = IoReq::zeroed();
    d.opcode = opcode as u16;
    d.fd = fd as u32;
    d.buf = buf;
    d.nbytes = nbytes;
    d.offset = offset;
    d.data = data;
    d
}

fn main() {
    let mut t = TestRunner::new();
    let svc = AioService::new();

    // ── Part A: context lifecycle ──
    t.section("Part A — context lifecycle");

    let mut handle = 0u64;
    let rc = svc.setup(32, &mut handle);
    t.check("setup(32)", rc.is_ok(), &format!("{:?}", rc));
    t.check("handle is the mapping base", handle != 0, "zero handle");

    let hdr = unsafe { std::ptr::read_volatile(handle as *const RingHeader) };
    t.check("header magic", hdr.magic == RING_MAGIC, "bad magic");
    t.check("header capacity >= request", hdr.nr >= 32, "short ring");
    t.check(
        "header length",
        hdr.header_length as usize == std::mem::size_of::<RingHeader>(),
        "bad header_length",
    );

    let mut scratch = 0u64;
    let dup = svc.setup(8, &mut scratch);
    t.check("second context coexists", dup.is_ok(), &format!("{:?}", dup));
    t.check("destroy second", svc.destroy(scratch).is_ok(), "destroy failed");

    // ── Part B: data path ──
    t.section("Part B — worker data path");

    let mut file = tempfile();
    let payload = b"the quick brown fox jumps over the lazy dog";
    file.write_all(payload).unwrap();
    file.flush().unwrap();
    let fd = file.as_raw_fd();

    let mut buf = vec![0u8; payload.len()];
    let mut rd = desc(
        Opcode::Pread,
        fd,
        buf.as_mut_ptr() as u64,
        buf.len() as u64,
        0,
        0xFEED,
    );
    let p = &mut rd as *mut IoReq;
    let n = unsafe { svc.submit(handle, &[p]) };
    t.check("submit pread", n == Ok(1), &format!("{:?}", n));

    let mut out = [CompletionRecord::zeroed(); 4];
    let n = svc.get_events(handle, 1, &mut out, None);
    t.check("reap one completion", n == Ok(1), &format!("{:?}", n));
    t.check(
        "completion echoes descriptor",
        out[0].obj == p as u64 && out[0].data == 0xFEED,
        "bad echo",
    );
    t.check(
        "read transferred everything",
        out[0].res == payload.len() as i64,
        &format!("res={}", out[0].res),
    );
    t.check("buffer contents", buf == payload, "mismatch");

    let rc = svc.get_events(handle, 0, &mut out, Some(Duration::ZERO));
    t.check("empty poll reaps zero", rc == Ok(0), &format!("{:?}", rc));

    // ── Part C: cancellation ──
    t.section("Part C — cancellation");

    let mut fds = [0i32; 2];
    unsafe { libc::pipe(fds.as_mut_ptr()) };
    let mut pd = desc(Opcode::Poll, fds[0], libc::POLLIN as u64, 0, 0, 0xDEAD);
    let pp = &mut pd as *mut IoReq;
    let n = unsafe { svc.submit(handle, &[pp]) };
    t.check("submit blocking poll", n == Ok(1), &format!("{:?}", n));

    std::thread::sleep(Duration::from_millis(10));
    let rc = unsafe { svc.cancel(handle, pp) };
    t.check("cancel initiates", rc.is_ok(), &format!("{:?}", rc));

    let n = svc.get_events(handle, 1, &mut out, Some(Duration::from_secs(5)));
    t.check("aborted completion arrives", n == Ok(1), &format!("{:?}", n));
    t.check(
        "aborted result is -EINTR",
        out[0].res == -(libc::EINTR as i64),
        &format!("res={}", out[0].res),
    );

    // ── Part D: teardown drains ──
    t.section("Part D — teardown");

    let mut parked: Vec<Box<IoReq>> = Vec::new();
    for i in 0..4u64 {
        let mut d = Box::new(desc(Opcode::Poll, fds[0], libc::POLLIN as u64, 0, 0, i));
        let dp = &mut *d as *mut IoReq;
        parked.push(d);
        let _ = unsafe { svc.submit(handle, &[dp]) };
    }
    let rc = svc.destroy(handle);
    t.check("destroy drains parked polls", rc.is_ok(), &format!("{:?}", rc));

    let rc = unsafe { svc.submit(handle, &[p]) };
    t.check(
        "dead handle rejected",
        rc == Err(AioError::BadHandle),
        &format!("{:?}", rc),
    );

    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }

    std::process::exit(t.summary());
}

fn tempfile() -> std::fs::File {
    let mut path = std::env::temp_dir();
    path.push(format!("aring-smoke-{}", std::process::id()));
    let f = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .expect("temp file");
    let _ = std::fs::remove_file(&path);
    f
}
