//! Request admission control.
//!
//! Bounds the number of simultaneously in-flight requests to the ring's
//! usable capacity (`nr_events − 1`) without touching a global atomic
//! on every submission: each CPU hoards a small batch of slots in its
//! own cache-line-padded cell and only consolidates through the one
//! global counter when a cell runs dry or overfills.
//!
//! `req_batch = max(1, usable / (ncpu × 4))` slots move per
//! consolidation. A cell is indexed by `sched_getcpu()`, so the common
//! case is an uncontended CAS on a line owned by the submitting CPU;
//! threads that migrate mid-operation merely contend on a neighbour's
//! cell, capacity is conserved either way.

use std::sync::atomic::{AtomicU32, Ordering};

#[repr(align(64))]
struct PerCpu {
    avail: AtomicU32,
}

pub struct Admission {
    /// Slow-path slot pool.
    global: AtomicU32,
    /// Slots moved between a cell and the global pool at a time.
    req_batch: u32,
    cpus: Box<[PerCpu]>,
}

impl Admission {
    /// `usable` is the ring capacity minus one.
    pub fn new(usable: u32, ncpu: usize) -> Self {
        let ncpu = ncpu.max(1);
        let req_batch = (usable / (ncpu as u32 * 4)).max(1);
        let cpus = (0..ncpu)
            .map(|_| PerCpu {
                avail: AtomicU32::new(0),
            })
            .collect();
        Self {
            global: AtomicU32::new(usable),
            req_batch,
            cpus,
        }
    }

    pub fn req_batch(&self) -> u32 {
        self.req_batch
    }

    #[inline]
    fn cell(&self) -> &PerCpu {
        &self.cpus[current_cpu() % self.cpus.len()]
    }

    /// Consume one slot. `false` means no slots are known to be
    /// available; the caller may refill from reaped ring entries and
    /// retry once (see the context's user refill).
    pub fn reserve_one(&self) -> bool {
        let cell = self.cell();
        loop {
            let cur = cell.avail.load(Ordering::Relaxed);
            if cur == 0 {
                if !self.pull_batch(cell) {
                    return false;
                }
                continue;
            }
            if cell
                .avail
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Move one batch global → cell. Fails when the global pool holds
    /// less than a full batch.
    fn pull_batch(&self, cell: &PerCpu) -> bool {
        let mut avail = self.global.load(Ordering::Relaxed);
        loop {
            if avail < self.req_batch {
                return false;
            }
            match self.global.compare_exchange_weak(
                avail,
                avail - self.req_batch,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    cell.avail.fetch_add(self.req_batch, Ordering::AcqRel);
                    return true;
                }
                Err(cur) => avail = cur,
            }
        }
    }

    /// Return `n` slots, flushing hoarded batches back to the global
    /// pool once the cell exceeds two batches.
    pub fn release(&self, n: u32) {
        let cell = self.cell();
        cell.avail.fetch_add(n, Ordering::AcqRel);
        loop {
            let cur = cell.avail.load(Ordering::Relaxed);
            if cur < self.req_batch * 2 {
                break;
            }
            if cell
                .avail
                .compare_exchange_weak(
                    cur,
                    cur - self.req_batch,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.global.fetch_add(self.req_batch, Ordering::AcqRel);
            }
        }
    }

    /// Global pool plus every cell. Momentarily stale under concurrent
    /// transfers; exact at rest. Diagnostics and invariant checks.
    pub fn total_available(&self) -> u32 {
        let cells: u32 = self
            .cpus
            .iter()
            .map(|c| c.avail.load(Ordering::Relaxed))
            .sum();
        self.global.load(Ordering::Relaxed) + cells
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        #[inline]
        fn current_cpu() -> usize {
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu < 0 {
                0
            } else {
                cpu as usize
            }
        }
    } else {
        #[inline]
        fn current_cpu() -> usize {
            0
        }
    }
}
