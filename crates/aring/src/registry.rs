//! The per-process context registry.
//!
//! A grow-only table of context slots, indexed by the small id embedded
//! in each ring header. Readers walk the current version with no lock;
//! writers serialize on the registry lock and publish a ×4-larger copy
//! by pointer swap when the table fills.
//!
//! Reclamation: a retired table version — or the strong reference of a
//! removed context — must outlive any reader that might still be
//! dereferencing it. Readers bracket their walk with a counter; retired
//! allocations park in a graveyard and are freed only when the counter
//! is observed at zero (by the next writer, or at drop). That is the
//! grace period: a reader section overlapping the swap holds the count
//! above zero for its whole duration.

use crate::context::AioContext;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Table {
    slots: Box<[AtomicPtr<AioContext>]>,
}

impl Table {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
        }
    }
}

#[derive(Default)]
struct Graveyard {
    tables: Vec<*mut Table>,
    /// Strong references of removed contexts, still owed a drop.
    ctxs: Vec<*const AioContext>,
}

// The graveyard owns everything it points at; the pointers only move
// between threads inside the registry's mutexes.
unsafe impl Send for Graveyard {}

pub struct Registry {
    current: AtomicPtr<Table>,
    readers: AtomicUsize,
    /// The registry (writer) lock. First in the lock order.
    writer: Mutex<()>,
    graveyard: Mutex<Graveyard>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Box::new(Table::new(0)))),
            readers: AtomicUsize::new(0),
            writer: Mutex::new(()),
            graveyard: Mutex::new(Graveyard::default()),
        }
    }

    /// Install a context into the first empty slot, growing if needed.
    /// Publishes the slot id into the context and its ring header.
    pub fn insert(&self, ctx: &Arc<AioContext>) -> u32 {
        let _guard = self.writer.lock().unwrap();
        loop {
            let table = unsafe { &*self.current.load(Ordering::Acquire) };
            for (i, slot) in table.slots.iter().enumerate() {
                if slot.load(Ordering::Relaxed).is_null() {
                    slot.store(
                        Arc::into_raw(Arc::clone(ctx)) as *mut AioContext,
                        Ordering::Release,
                    );
                    ctx.set_id(i as u32);
                    self.try_reclaim();
                    return i as u32;
                }
            }

            // Full: publish a copy four times larger.
            let new_len = if table.slots.is_empty() {
                4
            } else {
                table.slots.len() * 4
            };
            let new = Table::new(new_len);
            for (i, slot) in table.slots.iter().enumerate() {
                new.slots[i].store(slot.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            let old = self.current.swap(Box::into_raw(Box::new(new)), Ordering::AcqRel);
            self.graveyard.lock().unwrap().tables.push(old);
            log::debug!("registry grown to {} slots", new_len);
            self.try_reclaim();
        }
    }

    /// Clear a context's slot. `false` when the slot no longer holds it
    /// (double destroy race — the loser backs off).
    pub fn remove(&self, id: u32, ctx: &AioContext) -> bool {
        let _guard = self.writer.lock().unwrap();
        let table = unsafe { &*self.current.load(Ordering::Acquire) };
        let Some(slot) = table.slots.get(id as usize) else {
            return false;
        };
        let cur = slot.load(Ordering::Relaxed);
        if cur as *const AioContext != ctx as *const AioContext {
            return false;
        }
        slot.store(std::ptr::null_mut(), Ordering::Release);
        self.graveyard.lock().unwrap().ctxs.push(cur);
        self.try_reclaim();
        true
    }

    /// Resolve a handle: find the slot whose context carries this
    /// `user_id`, require the id embedded in its ring header to name
    /// that very slot, and take a users reference. Lock-free.
    pub fn lookup(&self, handle: u64) -> Option<Arc<AioContext>> {
        if handle == 0 {
            return None;
        }

        self.readers.fetch_add(1, Ordering::SeqCst);
        let table = unsafe { &*self.current.load(Ordering::SeqCst) };

        let mut found = None;
        for (i, slot) in table.slots.iter().enumerate() {
            let p = slot.load(Ordering::Acquire);
            if p.is_null() {
                continue;
            }
            let ctx = unsafe { &*p };
            if ctx.user_id() != handle {
                continue;
            }
            if ctx.header_id() == i as u32 && ctx.users_tryget() {
                // One new strong reference for the caller; the slot
                // keeps its own.
                unsafe {
                    Arc::increment_strong_count(p);
                    found = Some(Arc::from_raw(p));
                }
            }
            break;
        }

        self.readers.fetch_sub(1, Ordering::SeqCst);
        found
    }

    /// Strong references to every registered context, for the
    /// process-exit sweep.
    pub fn snapshot(&self) -> Vec<Arc<AioContext>> {
        let _guard = self.writer.lock().unwrap();
        let table = unsafe { &*self.current.load(Ordering::Acquire) };
        table
            .slots
            .iter()
            .filter_map(|slot| {
                let p = slot.load(Ordering::Relaxed);
                if p.is_null() {
                    None
                } else {
                    unsafe {
                        Arc::increment_strong_count(p);
                        Some(Arc::from_raw(p))
                    }
                }
            })
            .collect()
    }

    /// Free retired allocations if no reader section is live. Callers
    /// hold the writer lock, so nothing new retires concurrently.
    fn try_reclaim(&self) {
        if self.readers.load(Ordering::SeqCst) != 0 {
            return;
        }
        let mut grave = self.graveyard.lock().unwrap();
        for t in grave.tables.drain(..) {
            drop(unsafe { Box::from_raw(t) });
        }
        for c in grave.ctxs.drain(..) {
            drop(unsafe { Arc::from_raw(c) });
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Exclusive access: readers are gone by construction.
        let table = unsafe { Box::from_raw(self.current.load(Ordering::Relaxed)) };
        for slot in table.slots.iter() {
            let p = slot.load(Ordering::Relaxed);
            if !p.is_null() {
                drop(unsafe { Arc::from_raw(p) });
            }
        }
        let mut grave = self.graveyard.lock().unwrap();
        for t in grave.tables.drain(..) {
            drop(unsafe { Box::from_raw(t) });
        }
        for c in grave.ctxs.drain(..) {
            drop(unsafe { Arc::from_raw(c) });
        }
    }
}
