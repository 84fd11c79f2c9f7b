//! Per-request eventfd notification.
//!
//! A descriptor carrying the RESFD flag names an eventfd that receives
//! one increment per completion. Multiple completions before the
//! consumer reads coalesce by eventfd counter semantics.

use aring_core::error::{AioError, Result};
use std::os::unix::io::RawFd;

/// A borrowed or owned eventfd.
pub struct EventFd {
    fd: RawFd,
    owned: bool,
}

impl EventFd {
    /// Wrap a caller-supplied eventfd. The caller keeps ownership; the
    /// notifier does not close it on drop.
    pub fn from_raw(fd: RawFd) -> Result<Self> {
        // The only cheap validity probe that does not perturb the fd.
        let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if rc < 0 {
            return Err(AioError::BadDescriptor);
        }
        Ok(Self { fd, owned: false })
    }

    /// Create a fresh nonblocking eventfd, owned (closed on drop).
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(AioError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(Self { fd, owned: true })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Add one to the counter. A saturated counter (EAGAIN) already has
    /// a wakeup pending and counts as delivered.
    pub fn signal(&self) -> Result<()> {
        let val: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(AioError::Os(errno));
        }
        Ok(())
    }

    /// Drain the counter (test/consumer side). Returns the count read,
    /// 0 if the counter was empty.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let rc = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}
