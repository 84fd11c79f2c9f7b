//! Reaper wait queue.
//!
//! Blocked `get_events` callers park here until a completion is
//! published or the context dies. The queue is a generation counter:
//! waiters snapshot the generation, re-check their predicate, then
//! sleep until the generation moves. Wakeups between the snapshot and
//! the sleep are never lost because the sleep re-validates the counter.
//!
//! On Linux the sleep is a `FUTEX_WAIT` on the counter word, which a
//! delivered signal cuts short with `EINTR` — that is how a blocked
//! reaper observes interruption. Elsewhere a mutex/condvar pair stands
//! in (no signal observation).

use std::time::Duration;

/// Why a wait returned. Callers re-check their predicate regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The generation moved (or may have; spurious returns included).
    Woken,
    /// The timeout elapsed first.
    TimedOut,
    /// A signal was delivered to the waiting thread.
    Interrupted,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

        pub struct WaitQueue {
            /// Futex word: bumped once per wake_all.
            gen: AtomicU32,
            /// Parked waiter count, to skip the wake syscall when idle.
            waiters: AtomicUsize,
        }

        impl WaitQueue {
            pub fn new() -> Self {
                Self {
                    gen: AtomicU32::new(0),
                    waiters: AtomicUsize::new(0),
                }
            }

            /// Snapshot the generation. Check the predicate *after*
            /// calling this and pass the token to [`wait`](Self::wait).
            pub fn prepare(&self) -> u32 {
                self.gen.load(Ordering::Acquire)
            }

            pub fn wait(&self, token: u32, timeout: Option<Duration>) -> WaitOutcome {
                self.waiters.fetch_add(1, Ordering::SeqCst);

                if self.gen.load(Ordering::Acquire) != token {
                    self.waiters.fetch_sub(1, Ordering::SeqCst);
                    return WaitOutcome::Woken;
                }

                let ts = timeout.map(|d| libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                });
                let ts_ptr = match &ts {
                    Some(ts) => ts as *const libc::timespec,
                    None => std::ptr::null(),
                };

                // Sleeps only if the word still equals `token`.
                let rc = unsafe {
                    libc::syscall(
                        libc::SYS_futex,
                        self.gen.as_ptr(),
                        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                        token,
                        ts_ptr,
                        std::ptr::null::<u32>(),
                        0u32,
                    )
                };

                let outcome = if rc == 0 {
                    WaitOutcome::Woken
                } else {
                    match unsafe { *libc::__errno_location() } {
                        libc::ETIMEDOUT => WaitOutcome::TimedOut,
                        libc::EINTR => WaitOutcome::Interrupted,
                        // EAGAIN: the word moved before we slept.
                        _ => WaitOutcome::Woken,
                    }
                };

                self.waiters.fetch_sub(1, Ordering::SeqCst);
                outcome
            }

            /// Bump the generation and wake every parked waiter.
            pub fn wake_all(&self) {
                self.gen.fetch_add(1, Ordering::Release);
                if self.waiters.load(Ordering::SeqCst) > 0 {
                    unsafe {
                        libc::syscall(
                            libc::SYS_futex,
                            self.gen.as_ptr(),
                            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                            i32::MAX,
                            std::ptr::null::<libc::timespec>(),
                            std::ptr::null::<u32>(),
                            0u32,
                        );
                    }
                }
            }
        }
    } else {
        use std::sync::{Condvar, Mutex};

        pub struct WaitQueue {
            gen: Mutex<u32>,
            cv: Condvar,
        }

        impl WaitQueue {
            pub fn new() -> Self {
                Self { gen: Mutex::new(0), cv: Condvar::new() }
            }

            pub fn prepare(&self) -> u32 {
                *self.gen.lock().unwrap()
            }

            pub fn wait(&self, token: u32, timeout: Option<Duration>) -> WaitOutcome {
                let guard = self.gen.lock().unwrap();
                if *guard != token {
                    return WaitOutcome::Woken;
                }
                match timeout {
                    Some(d) => {
                        let (_g, res) = self
                            .cv
                            .wait_timeout_while(guard, d, |g| *g == token)
                            .unwrap();
                        if res.timed_out() {
                            WaitOutcome::TimedOut
                        } else {
                            WaitOutcome::Woken
                        }
                    }
                    None => {
                        let _g = self.cv.wait_while(guard, |g| *g == token).unwrap();
                        WaitOutcome::Woken
                    }
                }
            }

            pub fn wake_all(&self) {
                *self.gen.lock().unwrap() += 1;
                self.cv.notify_all();
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
