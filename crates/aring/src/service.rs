//! The handle-based service surface.
//!
//! One [`AioService`] is a process's view of the subsystem: it owns the
//! context registry, the system-wide request quota, the worker pool and
//! the optional native backend. The five entry points mirror the
//! syscall surface: `setup`, `destroy`, `submit`, `cancel`,
//! `get_events`, plus the process-exit sweep `exit_all`.

use crate::context::{AioContext, DrainWait};
use crate::registry::Registry;
use crate::ring::RECORD_SIZE;
use crate::submit::submit_one;
use crate::worker::FixedPool;
use aring_core::backend::NativeIo;
use aring_core::entry::{CompletionRecord, IoReq};
use aring_core::error::{AioError, Result};
use aring_core::executor::WorkerExecutor;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Rings larger than this many records are rejected outright.
const MAX_RING_RECORDS: u32 = (0x1000_0000usize / RECORD_SIZE) as u32;

/// Service-wide tunables.
#[derive(Debug, Clone)]
pub struct AioConfig {
    /// System-wide in-flight request quota; each context charges its
    /// (rounded) capacity against it.
    pub max_reqs: u64,
    /// Worker pool size; 0 picks min(8, nproc/2), at least 2.
    pub worker_threads: usize,
    /// Whether the worker fallback path is offered. Reported in the
    /// ring header's compat features.
    pub worker_enabled: bool,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            max_reqs: 0x10000,
            worker_threads: 0,
            worker_enabled: true,
        }
    }
}

/// State shared by the service, its contexts and their requests.
pub(crate) struct Shared {
    pub(crate) config: AioConfig,
    /// Current system-wide charge (the quota lock).
    quota_used: Mutex<u64>,
    pub(crate) pool: Box<dyn WorkerExecutor>,
    pub(crate) native: Option<Arc<dyn NativeIo>>,
}

impl Shared {
    fn new(config: AioConfig, native: Option<Arc<dyn NativeIo>>) -> Arc<Self> {
        let pool: Box<dyn WorkerExecutor> = if config.worker_threads == 0 {
            Box::new(FixedPool::auto_sized())
        } else {
            Box::new(FixedPool::new(config.worker_threads))
        };
        Arc::new(Self {
            config,
            quota_used: Mutex::new(0),
            pool,
            native,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: AioConfig) -> Arc<Self> {
        Self::new(config, None)
    }

    fn quota_charge(&self, n: u64) -> Result<()> {
        let mut used = self.quota_used.lock().unwrap();
        let next = used.checked_add(n).ok_or(AioError::TryAgain)?;
        if next > self.config.max_reqs * 2 {
            return Err(AioError::TryAgain);
        }
        *used = next;
        Ok(())
    }

    fn quota_uncharge(&self, n: u64) {
        let mut used = self.quota_used.lock().unwrap();
        *used = used.saturating_sub(n);
    }
}

/// Builder for a service instance; every collaborator can be tuned
/// before [`build`](Self::build).
pub struct ServiceBuilder {
    config: AioConfig,
    native: Option<Arc<dyn NativeIo>>,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self {
            config: AioConfig::default(),
            native: None,
        }
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_reqs(mut self, n: u64) -> Self {
        self.config.max_reqs = n;
        self
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    pub fn worker_enabled(mut self, enabled: bool) -> Self {
        self.config.worker_enabled = enabled;
        self
    }

    /// Install a native asynchronous backend for data transfers.
    pub fn native(mut self, backend: Arc<dyn NativeIo>) -> Self {
        self.native = Some(backend);
        self
    }

    pub fn build(self) -> AioService {
        AioService {
            registry: Registry::new(),
            shared: Shared::new(self.config, self.native),
        }
    }
}

pub struct AioService {
    registry: Registry,
    shared: Arc<Shared>,
}

impl AioService {
    /// A service with default configuration.
    pub fn new() -> Self {
        ServiceBuilder::new().build()
    }

    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Create a context able to hold at least `nr_events` in-flight
    /// requests and write its handle into `handle_out`, which must be
    /// zero on entry.
    pub fn setup(&self, nr_events: u32, handle_out: &mut u64) -> Result<()> {
        if *handle_out != 0 || nr_events == 0 {
            log::debug!("setup: handle slot {:#x} nr {}", *handle_out, nr_events);
            return Err(AioError::InvalidArgument);
        }
        let ctx = self.ioctx_alloc(nr_events)?;
        *handle_out = ctx.user_id();
        Ok(())
    }

    fn ioctx_alloc(&self, nr_events: u32) -> Result<Arc<AioContext>> {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4) as u32;

        // Up to half the usable slots can be hoarded on other CPUs'
        // cells; double the request so callers see the capacity they
        // asked for, and keep req_batch off zero.
        let nr = nr_events
            .max(ncpu * 4)
            .checked_mul(2)
            .ok_or(AioError::InvalidArgument)?;
        if nr > MAX_RING_RECORDS {
            return Err(AioError::InvalidArgument);
        }
        if nr as u64 > self.shared.config.max_reqs * 2 {
            return Err(AioError::TryAgain);
        }

        let ctx = AioContext::new(nr, &self.shared)?;
        self.shared.quota_charge(ctx.max_reqs() as u64)?;

        let id = self.registry.insert(&ctx);
        log::debug!(
            "setup context {:#x} id={} nr_events={}",
            ctx.user_id(),
            id,
            ctx.nr_events()
        );
        Ok(ctx)
    }

    /// The single-caller teardown transition: mark dead, pull the
    /// registry slot, wake reapers, uncharge, and let the users count
    /// drain into request cancellation.
    fn kill_ctx(&self, ctx: &Arc<AioContext>, wait: &Arc<DrainWait>) -> Result<()> {
        if ctx.mark_dead() {
            return Err(AioError::BadHandle);
        }
        self.registry.remove(ctx.id(), ctx);
        ctx.wake_reapers();

        // Uncharge now rather than at the final free: destroy has
        // returned by then and a subsequent setup would spuriously see
        // the quota exhausted.
        self.shared.quota_uncharge(ctx.max_reqs() as u64);

        ctx.set_drain(Arc::clone(wait));
        ctx.users_put();
        Ok(())
    }

    /// Tear a context down, cancelling outstanding requests, and block
    /// until every one of them has finalized.
    pub fn destroy(&self, handle: u64) -> Result<()> {
        let ctx = self.registry.lookup(handle).ok_or(AioError::BadHandle)?;
        let wait = Arc::new(DrainWait::new(1));
        let res = self.kill_ctx(&ctx, &wait);
        ctx.users_put();
        drop(ctx);
        match res {
            Ok(()) => {
                wait.wait();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Submit a batch of descriptors. Returns how many were accepted;
    /// the first failure aborts the rest and is reported only when
    /// nothing was accepted.
    ///
    /// # Safety
    /// Every pointer in `iocbs` must reference a live descriptor; the
    /// service writes each accepted descriptor's key field and keeps
    /// reading the buffers (and iovec arrays) the descriptors point at
    /// until their completions are published.
    pub unsafe fn submit(&self, handle: u64, iocbs: &[*mut IoReq]) -> Result<usize> {
        let ctx = self.registry.lookup(handle).ok_or(AioError::BadHandle)?;

        let mut submitted = 0usize;
        let mut first_err = None;
        for &user_iocb in iocbs {
            if user_iocb.is_null() {
                first_err = Some(AioError::BadAddress);
                break;
            }
            let copy = ptr::read_volatile(user_iocb as *const IoReq);
            match submit_one(&ctx, user_iocb, &copy) {
                Ok(()) => submitted += 1,
                Err(e) => {
                    first_err = Some(e);
                    break;
                }
            }
        }

        ctx.users_put();
        if submitted > 0 {
            Ok(submitted)
        } else if let Some(e) = first_err {
            Err(e)
        } else {
            Ok(0)
        }
    }

    /// Initiate cancellation of one submitted descriptor. Ok means the
    /// request was claimed and its (aborted) completion will arrive in
    /// the ring — the errno shim reports this as EINPROGRESS.
    ///
    /// # Safety
    /// `iocb` must point at the descriptor previously submitted.
    pub unsafe fn cancel(&self, handle: u64, iocb: *mut IoReq) -> Result<()> {
        if iocb.is_null() {
            return Err(AioError::BadAddress);
        }
        let key = ptr::read_volatile(ptr::addr_of!((*iocb).key));
        let ctx = self.registry.lookup(handle).ok_or(AioError::BadHandle)?;

        let res = match ctx.lookup_active(iocb as u64, key) {
            Some(req) => req.cancel(),
            None => Err(AioError::InvalidArgument),
        };

        ctx.users_put();
        res
    }

    /// Reap up to `out.len()` completions, waiting until at least `min`
    /// arrive. `timeout` of `None` waits forever; zero polls once.
    pub fn get_events(
        &self,
        handle: u64,
        min: usize,
        out: &mut [CompletionRecord],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let ctx = self.registry.lookup(handle).ok_or(AioError::BadHandle)?;
        let res = ctx.read_events(min, out, timeout);
        ctx.users_put();
        res
    }

    /// The process-exit path: destroy every live context with one
    /// shared drain completion, then block until all have finalized.
    pub fn exit_all(&self) {
        let ctxs = self.registry.snapshot();
        if ctxs.is_empty() {
            return;
        }
        log::debug!("exit sweep over {} contexts", ctxs.len());
        let wait = Arc::new(DrainWait::new(ctxs.len()));
        for ctx in ctxs {
            if self.kill_ctx(&ctx, &wait).is_err() {
                wait.discount();
            }
        }
        wait.wait();
    }
}

impl Default for AioService {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered teardown: contexts (and their in-flight requests) first,
/// then the worker pool the cancellations were delivered through.
impl Drop for AioService {
    fn drop(&mut self) {
        self.exit_all();
        self.shared.pool.shutdown();
    }
}
