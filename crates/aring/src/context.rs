//! The per-handle context: ring ownership, admission, the active
//! request list, and the two-stage teardown.
//!
//! A context carries two independent reference counts:
//!
//! - **users** — submitters and reapers. Lookup takes one, the syscall
//!   surface puts it back. When users drains to zero the context is
//!   logically dead: every active request is cancelled and the
//!   implicit *requests* reference is dropped.
//! - **requests** — one per in-flight request. When requests drains to
//!   zero the final free runs: the drain completion (if any) is
//!   signalled and the ring pages are unmapped.
//!
//! Splitting the counts breaks the context↔request ownership cycle:
//! requests hold *requests* only, submitters hold *users* only, and
//! cancel-all is triggered by the users drain rather than by any
//! individual request going away.
//!
//! Lock order within a context: `ring_lock` → `ctx_lock` (active list)
//! → `completion_lock` (producer cursor). Never reversed.

use crate::park::{WaitOutcome, WaitQueue};
use crate::request::AioRequest;
use crate::ring::{Producer, RingPages, PAGE_SIZE};
use crate::service::Shared;
use aring_core::entry::CompletionRecord;
use aring_core::error::{AioError, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counts contexts still draining; `destroy` and the process-exit path
/// block on it until every in-flight request has finalized.
pub struct DrainWait {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl DrainWait {
    pub fn new(n: usize) -> Self {
        Self {
            remaining: Mutex::new(n),
            cv: Condvar::new(),
        }
    }

    /// One context finished draining.
    pub fn complete_one(&self) {
        let mut left = self.remaining.lock().unwrap();
        *left -= 1;
        if *left == 0 {
            self.cv.notify_all();
        }
    }

    /// A context turned out not to need draining (already dead).
    pub fn discount(&self) {
        self.complete_one();
    }

    pub fn wait(&self) {
        let mut left = self.remaining.lock().unwrap();
        while *left > 0 {
            left = self.cv.wait(left).unwrap();
        }
    }
}

pub struct AioContext {
    /// The handle: base address of the mapped ring.
    user_id: u64,
    /// Registry slot, mirrored into the ring header.
    id: AtomicU32,
    /// Trusted ring capacity in records.
    nr_events: u32,
    /// What this context charges against the system-wide quota.
    max_reqs: u32,

    dead: AtomicBool,
    users: AtomicUsize,
    reqs: AtomicUsize,

    admission: crate::admission::Admission,

    /// ctx_lock: the active request list, for cancellation.
    active: Mutex<Vec<Arc<AioRequest>>>,

    ring: RingPages,
    /// ring_lock: serializes reapers against each other and against
    /// page migration.
    ring_lock: Mutex<()>,
    /// completion_lock: producer cursor + recycling counter.
    producer: Mutex<Producer>,
    /// Service-trusted count of records currently in the ring
    /// (published minus recycled). Bounds the reap copy so a hostile
    /// header `head` cannot manufacture records.
    in_ring: AtomicU32,

    wait: WaitQueue,
    drain: Mutex<Option<Arc<DrainWait>>>,

    shared: Arc<Shared>,
}

impl AioContext {
    /// Build a context with a ring of at least `nr` records. The caller
    /// (the service) handles quota and registry insertion.
    pub(crate) fn new(nr: u32, shared: &Arc<Shared>) -> Result<Arc<Self>> {
        let ring = RingPages::alloc(nr, shared.config.worker_enabled)?;
        let nr_events = ring.nr_events();
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let ctx = Arc::new(Self {
            user_id: ring.user_base(),
            id: AtomicU32::new(!0),
            nr_events,
            max_reqs: nr,
            dead: AtomicBool::new(false),
            users: AtomicUsize::new(1),
            reqs: AtomicUsize::new(1),
            admission: crate::admission::Admission::new(nr_events - 1, ncpu),
            active: Mutex::new(Vec::new()),
            ring,
            ring_lock: Mutex::new(()),
            producer: Mutex::new(Producer {
                tail: 0,
                completed_events: 0,
            }),
            in_ring: AtomicU32::new(0),
            wait: WaitQueue::new(),
            drain: Mutex::new(None),
            shared: Arc::clone(shared),
        });
        log::debug!(
            "allocated context {:#x}: nr_events={} req_batch={}",
            ctx.user_id,
            nr_events,
            ctx.admission.req_batch()
        );
        Ok(ctx)
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    /// The id the ring header currently carries (caller-visible page).
    pub fn header_id(&self) -> u32 {
        self.ring.id()
    }

    pub fn nr_events(&self) -> u32 {
        self.nr_events
    }

    pub(crate) fn max_reqs(&self) -> u32 {
        self.max_reqs
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// The single 0→1 transition of logical teardown. `true` when some
    /// other caller already performed it.
    pub(crate) fn mark_dead(&self) -> bool {
        self.dead.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
        self.ring.set_id(id);
    }

    pub(crate) fn set_drain(&self, wait: Arc<DrainWait>) {
        *self.drain.lock().unwrap() = Some(wait);
    }

    // ── reference counts ──

    /// Take a users reference unless the count already drained. Used by
    /// lookup so a stale registry read cannot resurrect a dead context.
    pub(crate) fn users_tryget(&self) -> bool {
        let mut cur = self.users.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.users.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
    }

    pub(crate) fn users_put(self: &Arc<Self>) {
        if self.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain_users();
        }
    }

    pub(crate) fn reqs_get(&self) {
        self.reqs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reqs_put(&self) {
        if self.reqs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.final_free();
        }
    }

    /// users drained: no more submissions can reach this context, so
    /// it is safe to cancel whatever is still active, then let the
    /// requests count take over.
    fn drain_users(self: &Arc<Self>) {
        let actives: Vec<Arc<AioRequest>> = {
            let mut list = self.active.lock().unwrap();
            for req in list.iter() {
                req.linked_flag().store(false, Ordering::Release);
            }
            std::mem::take(&mut *list)
        };
        log::debug!(
            "context {:#x} user drain: cancelling {} active requests",
            self.user_id,
            actives.len()
        );
        for req in actives {
            let _ = req.cancel();
        }
        self.reqs_put();
    }

    /// requests drained: signal whoever is waiting in destroy, then
    /// drop the ring pages. The context shell itself goes with the
    /// last Arc.
    fn final_free(&self) {
        if let Some(wait) = self.drain.lock().unwrap().take() {
            wait.complete_one();
        }
        self.ring.release();
        log::debug!("freed context {:#x}", self.user_id);
    }

    // ── admission ──

    /// Reserve one in-flight slot, refilling from caller-reaped ring
    /// entries when the fast path runs dry.
    pub(crate) fn reserve_slot(&self) -> bool {
        if self.admission.reserve_one() {
            return true;
        }
        self.user_refill();
        self.admission.reserve_one()
    }

    pub(crate) fn release_slot(&self, n: u32) {
        self.admission.release(n);
    }

    /// Recycle slots for ring entries the caller has consumed but the
    /// service has not yet accounted. Called when reservation fails and
    /// opportunistically from the publish path.
    fn user_refill(&self) {
        let mut prod = self.producer.lock().unwrap();
        if prod.completed_events > 0 {
            // The caller may race this header read; either the old or
            // the new head is fine — completed_events caps the release
            // and tail cannot move while we hold the completion lock.
            let head = self.ring.head();
            self.refill_locked(&mut prod, head);
        }
    }

    /// Convert consumed ring entries into admission slots. Caller holds
    /// the completion lock. `head` is the untrusted header value.
    fn refill_locked(&self, prod: &mut Producer, head: u32) {
        let head = head % self.nr_events;
        let tail = prod.tail;
        let events_in_ring = if head <= tail {
            tail - head
        } else {
            self.nr_events - (head - tail)
        };

        let completed = prod.completed_events.saturating_sub(events_in_ring);
        if completed == 0 {
            return;
        }

        prod.completed_events -= completed;
        let _ = self
            .in_ring
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(completed))
            });
        self.admission.release(completed);
    }

    // ── completion publication ──

    /// Producer side: append one record and recycle eagerly when more
    /// than one completion has accumulated.
    pub(crate) fn publish(&self, obj: u64, data: u64, res: i64, res2: i64) {
        let mut prod = self.producer.lock().unwrap();
        let head = self.ring.push_record(
            &mut prod,
            CompletionRecord {
                obj,
                data,
                res,
                res2,
            },
        );
        self.in_ring.fetch_add(1, Ordering::AcqRel);
        log::trace!(
            "context {:#x}: published obj={:#x} res={} at tail={}",
            self.user_id,
            obj,
            res,
            prod.tail
        );
        if prod.completed_events > 1 {
            self.refill_locked(&mut prod, head);
        }
    }

    pub(crate) fn wake_reapers(&self) {
        self.wait.wake_all();
    }

    // ── active list ──

    /// First-install links the request into the active list; the
    /// handler store happens under the same lock hold.
    pub(crate) fn link_and_install(
        &self,
        req: &Arc<AioRequest>,
        f: crate::request::CancelFn,
    ) {
        let mut list = self.active.lock().unwrap();
        if !req.linked_flag().load(Ordering::Acquire) {
            req.linked_flag().store(true, Ordering::Release);
            list.push(Arc::clone(req));
        }
        req.cancel_slot().install(f);
    }

    pub(crate) fn unlink_request(&self, req: &Arc<AioRequest>) {
        if !req.linked_flag().load(Ordering::Acquire) {
            return;
        }
        let mut list = self.active.lock().unwrap();
        if let Some(pos) = list.iter().position(|r| Arc::ptr_eq(r, req)) {
            list.swap_remove(pos);
        }
        req.linked_flag().store(false, Ordering::Release);
    }

    /// Map a caller descriptor pointer back to its active request for
    /// cancellation.
    pub(crate) fn lookup_active(&self, user_iocb: u64, key: u32) -> Option<Arc<AioRequest>> {
        if key != aring_core::entry::REQ_KEY {
            return None;
        }
        let list = self.active.lock().unwrap();
        list.iter()
            .find(|r| r.user_iocb() == user_iocb)
            .map(Arc::clone)
    }

    // ── reaping ──

    fn reap_into(&self, out: &mut [CompletionRecord]) -> usize {
        let _guard = self.ring_lock.lock().unwrap();
        let n = self
            .ring
            .reap(out, self.in_ring.load(Ordering::Acquire));
        if n > 0 {
            log::trace!("context {:#x}: reaped {}", self.user_id, n);
        }
        n
    }

    /// The bounded-wait read path. `min` completions are awaited unless
    /// the timeout elapses (`None` waits forever, zero polls once); a
    /// signal with nothing accumulated surfaces as Interrupted, and a
    /// dead context as BadHandle.
    pub(crate) fn read_events(
        &self,
        min: usize,
        out: &mut [CompletionRecord],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if min > out.len() {
            return Err(AioError::InvalidArgument);
        }
        let poll_once = timeout == Some(Duration::ZERO);
        let deadline = match timeout {
            Some(d) if !d.is_zero() => Some(Instant::now() + d),
            _ => None,
        };

        let mut collected = 0usize;
        loop {
            // Snapshot the wake generation before checking the
            // predicate so a completion between check and sleep is
            // never lost.
            let token = self.wait.prepare();

            collected += self.reap_into(&mut out[collected..]);

            if self.is_dead() {
                return if collected > 0 {
                    Ok(collected)
                } else {
                    Err(AioError::BadHandle)
                };
            }
            if collected >= min || poll_once {
                return Ok(collected);
            }

            let remaining = match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Ok(collected);
                    }
                    Some(dl - now)
                }
                None => None,
            };

            if self.wait.wait(token, remaining) == WaitOutcome::Interrupted {
                return if collected > 0 {
                    Ok(collected)
                } else {
                    Err(AioError::Interrupted)
                };
            }
        }
    }

    // ── page migration ──

    /// Host-driven substitution of the physical page behind ring slot
    /// `idx`. Takes `ring_lock` then `completion_lock`, so reapers and
    /// the producer are both quiesced for the duration of the copy.
    pub fn migrate_page(&self, idx: usize) -> Result<()> {
        if idx == 0 || idx >= self.ring.nr_pages() {
            return Err(AioError::InvalidArgument);
        }
        let fresh = RingPages::alloc_page()?;
        let guard = self.ring_lock.lock().unwrap();
        let old = self.ring.page(idx);
        let prod = self.producer.lock().unwrap();
        let res = self.ring.migrate_slot(idx, old, fresh);
        drop(prod);
        drop(guard);
        if res.is_err() {
            unsafe {
                libc::munmap(fresh as *mut libc::c_void, PAGE_SIZE);
            }
        } else {
            log::debug!("context {:#x}: migrated ring page {}", self.user_id, idx);
        }
        res
    }

    /// Capacity invariant probe: admission slots available plus
    /// records in the ring plus in-flight requests equals
    /// `nr_events − 1` at rest.
    pub fn available_plus_in_ring(&self) -> u32 {
        self.admission.total_available() + self.in_ring.load(Ordering::Relaxed)
    }
}
