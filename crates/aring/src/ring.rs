//! The shared completion ring.
//!
//! A context's ring is one contiguous anonymous mapping: page 0 opens
//! with the [`RingHeader`], records follow to the end of the mapping
//! and never straddle a page boundary (page 0 holds one record less
//! than the rest). The mapping's base address is the context handle
//! the caller gets back from setup.
//!
//! The service additionally keeps a per-page pointer table and performs
//! every record access through it, so the host may substitute the
//! physical page behind a slot (page migration) without stopping the
//! producer for longer than one lock hold. Page 0 is exempt — its
//! address *is* the handle.
//!
//! Producer discipline (caller holds the context's completion lock):
//! write the record, release-fence, then publish the new `tail` in the
//! header. Consumer discipline (ring mutex held): read `head`/`tail`,
//! acquire-fence, then copy records out. `head` is caller-writable
//! shared memory and is clamped modulo capacity on every read; the
//! copy count is additionally bounded by the service's own count of
//! records it believes are present, so a hostile `head` can surface
//! stale bytes at worst, never an out-of-bounds access.

use aring_core::entry::{
    CompletionRecord, RingHeader, COMPAT_BASE, COMPAT_WORKER, INCOMPAT_FEATURES, RING_MAGIC,
};
use aring_core::error::{AioError, Result};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, Ordering};

pub const PAGE_SIZE: usize = 4096;
pub const RECORD_SIZE: usize = size_of::<CompletionRecord>();
pub const HEADER_LEN: usize = size_of::<RingHeader>();
/// Records per full page.
pub const RECORDS_PER_PAGE: usize = PAGE_SIZE / RECORD_SIZE;
/// Records in the header-shortened page 0.
pub const RECORDS_FIRST_PAGE: usize = (PAGE_SIZE - HEADER_LEN) / RECORD_SIZE;
/// Index bias accounting for the header: ring index `i` lives at raw
/// record position `i + RECORD_OFFSET`.
pub const RECORD_OFFSET: usize = RECORDS_PER_PAGE - RECORDS_FIRST_PAGE;

/// Producer cursor and the recycling counter, guarded by the context's
/// completion lock. `tail` here is the trusted copy; the header's is
/// the published one.
pub struct Producer {
    pub tail: u32,
    /// Completions published since slots were last recycled into the
    /// admission counter.
    pub completed_events: u32,
}

pub struct RingPages {
    /// Base of the contiguous mapping; null once released.
    base: AtomicPtr<u8>,
    map_len: usize,
    /// Per-page access table; entries may point outside the base
    /// mapping after a migration.
    pages: Box<[AtomicPtr<u8>]>,
    nr_events: u32,
}

fn map_anon(len: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(AioError::OutOfMemory);
    }
    Ok(ptr as *mut u8)
}

impl RingPages {
    /// Allocate and map a ring holding at least `nr_req` records, and
    /// initialize the header. The real capacity is rounded up to what
    /// the page allocation holds; read it back with
    /// [`nr_events`](Self::nr_events).
    pub fn alloc(nr_req: u32, worker_available: bool) -> Result<Self> {
        let bytes = HEADER_LEN + nr_req as usize * RECORD_SIZE;
        let nr_pages = bytes.div_ceil(PAGE_SIZE);
        let map_len = nr_pages * PAGE_SIZE;
        let base = map_anon(map_len)?;

        let nr_events = ((map_len - HEADER_LEN) / RECORD_SIZE) as u32;
        let pages = (0..nr_pages)
            .map(|i| AtomicPtr::new(unsafe { base.add(i * PAGE_SIZE) }))
            .collect();

        let ring = Self {
            base: AtomicPtr::new(base),
            map_len,
            pages,
            nr_events,
        };

        let mut compat = COMPAT_BASE;
        if worker_available {
            compat |= COMPAT_WORKER;
        }
        let hdr = ring.header();
        unsafe {
            ptr::write_volatile(
                hdr,
                RingHeader {
                    id: !0,
                    nr: nr_events,
                    head: 0,
                    tail: 0,
                    magic: RING_MAGIC,
                    compat_features: compat,
                    incompat_features: INCOMPAT_FEATURES,
                    header_length: HEADER_LEN as u32,
                },
            );
        }
        Ok(ring)
    }

    /// Trusted record capacity.
    pub fn nr_events(&self) -> u32 {
        self.nr_events
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    /// The handle value: base address of the mapping.
    pub fn user_base(&self) -> u64 {
        self.base.load(Ordering::Acquire) as u64
    }

    fn header(&self) -> *mut RingHeader {
        self.pages[0].load(Ordering::Relaxed) as *mut RingHeader
    }

    /// Atomic view of a header word shared with the caller.
    ///
    /// The mapping outlives every user of this view (the context frees
    /// the ring only after both refcounts drain), and concurrent caller
    /// stores are exactly what the atomic type is for.
    fn hdr_word(&self, field: *mut u32) -> &AtomicU32 {
        unsafe { &*(field as *const AtomicU32) }
    }

    pub fn head(&self) -> u32 {
        let hdr = self.header();
        self.hdr_word(unsafe { ptr::addr_of_mut!((*hdr).head) })
            .load(Ordering::Acquire)
    }

    pub fn set_head(&self, v: u32) {
        let hdr = self.header();
        self.hdr_word(unsafe { ptr::addr_of_mut!((*hdr).head) })
            .store(v, Ordering::Release);
    }

    pub fn tail(&self) -> u32 {
        let hdr = self.header();
        self.hdr_word(unsafe { ptr::addr_of_mut!((*hdr).tail) })
            .load(Ordering::Acquire)
    }

    fn set_tail(&self, v: u32) {
        let hdr = self.header();
        self.hdr_word(unsafe { ptr::addr_of_mut!((*hdr).tail) })
            .store(v, Ordering::Release);
    }

    /// Publish the registry id into the header (after insert).
    pub fn set_id(&self, id: u32) {
        let hdr = self.header();
        self.hdr_word(unsafe { ptr::addr_of_mut!((*hdr).id) })
            .store(id, Ordering::Release);
    }

    pub fn id(&self) -> u32 {
        let hdr = self.header();
        self.hdr_word(unsafe { ptr::addr_of_mut!((*hdr).id) })
            .load(Ordering::Acquire)
    }

    /// Record slot for raw position `pos` (ring index + RECORD_OFFSET),
    /// resolved through the page table.
    fn record_ptr(&self, pos: usize) -> *mut CompletionRecord {
        let page = self.pages[pos / RECORDS_PER_PAGE].load(Ordering::Relaxed);
        unsafe { page.add((pos % RECORDS_PER_PAGE) * RECORD_SIZE) as *mut CompletionRecord }
    }

    /// Producer: write one record and publish the advanced tail.
    /// Caller holds the completion lock. Returns the `head` snapshot
    /// taken alongside the tail publication, for slot recycling.
    pub fn push_record(&self, prod: &mut Producer, rec: CompletionRecord) -> u32 {
        let tail = prod.tail;
        let pos = tail as usize + RECORD_OFFSET;
        let mut new_tail = tail + 1;
        if new_tail >= self.nr_events {
            new_tail = 0;
        }

        unsafe {
            ptr::write_volatile(self.record_ptr(pos), rec);
        }

        // The record must be visible before the tail advance is.
        fence(Ordering::Release);

        prod.tail = new_tail;
        let head = self.head();
        self.set_tail(new_tail);
        prod.completed_events += 1;
        head
    }

    /// Consumer: copy out up to `out.len()` records, wrapping at the
    /// ring boundary and stopping at page edges. Caller holds the ring
    /// mutex. `present` is the service-trusted count of records in the
    /// ring; a `head` placing more than that many records before the
    /// tail is hostile (or a rewind) and reads as empty rather than as
    /// fabricated records.
    pub fn reap(&self, out: &mut [CompletionRecord], present: u32) -> usize {
        let mut head = self.head();
        let tail = self.tail();

        // Pair with the producer's release fence: records stored before
        // the tail we just read are visible below.
        fence(Ordering::Acquire);

        if head == tail {
            return 0;
        }
        head %= self.nr_events;
        let tail = tail % self.nr_events;

        let claimed = if head <= tail {
            tail - head
        } else {
            self.nr_events - (head - tail)
        };
        if claimed > present {
            return 0;
        }

        let budget = out.len().min(claimed as usize);
        let mut copied = 0;

        while copied < budget && head != tail {
            let mut avail = (if head <= tail { tail } else { self.nr_events }) as usize - head as usize;
            avail = avail.min(budget - copied);
            avail = avail.min(RECORDS_PER_PAGE - (head as usize + RECORD_OFFSET) % RECORDS_PER_PAGE);

            for i in 0..avail {
                out[copied + i] =
                    unsafe { ptr::read_volatile(self.record_ptr(head as usize + i + RECORD_OFFSET)) };
            }

            copied += avail;
            head = (head + avail as u32) % self.nr_events;
        }

        if copied > 0 {
            self.set_head(head);
        }
        copied
    }

    /// Substitute the page behind slot `idx` with `new_page`, which
    /// must be a fresh page-sized mapping. Both ring locks are held by
    /// the (context-level) caller. Fails without side effects when
    /// `old` no longer matches the slot. Page 0 is never migratable:
    /// its address is the context handle.
    pub fn migrate_slot(&self, idx: usize, old: *mut u8, new_page: *mut u8) -> Result<()> {
        if idx == 0 || idx >= self.pages.len() {
            return Err(AioError::InvalidArgument);
        }
        let cur = self.pages[idx].load(Ordering::Relaxed);
        if cur != old {
            return Err(AioError::TryAgain);
        }
        unsafe {
            ptr::copy_nonoverlapping(cur, new_page, PAGE_SIZE);
        }
        self.pages[idx].store(new_page, Ordering::Release);
        if !self.is_inline(cur) {
            unsafe {
                libc::munmap(cur as *mut libc::c_void, PAGE_SIZE);
            }
        }
        Ok(())
    }

    /// Current page pointer for a slot (migration callers snapshot it).
    pub fn page(&self, idx: usize) -> *mut u8 {
        self.pages[idx].load(Ordering::Acquire)
    }

    /// Allocate a fresh page suitable for [`migrate_slot`](Self::migrate_slot).
    pub fn alloc_page() -> Result<*mut u8> {
        map_anon(PAGE_SIZE)
    }

    fn is_inline(&self, p: *mut u8) -> bool {
        let base = self.base.load(Ordering::Relaxed);
        !base.is_null() && p >= base && p < unsafe { base.add(self.map_len) }
    }

    /// Unmap everything. Idempotent; also run by Drop. Callers must
    /// guarantee no further ring access (the context does this by
    /// releasing only after the requests refcount drains).
    pub fn release(&self) {
        let base = self.base.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if base.is_null() {
            return;
        }
        for slot in self.pages.iter() {
            let p = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            let inline = p >= base && p < unsafe { base.add(self.map_len) };
            if !p.is_null() && !inline {
                unsafe {
                    libc::munmap(p as *mut libc::c_void, PAGE_SIZE);
                }
            }
        }
        unsafe {
            libc::munmap(base as *mut libc::c_void, self.map_len);
        }
    }
}

impl Drop for RingPages {
    fn drop(&mut self) {
        self.release();
    }
}
