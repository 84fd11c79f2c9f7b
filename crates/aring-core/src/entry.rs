//! Request descriptor, completion record and ring header types.
//!
//! These are the *lingua franca* between the caller and the service:
//! the descriptor is read from caller memory at submit time, the record
//! and header live in the memory-mapped completion ring the caller
//! reaps from. All three are `#[repr(C)]`, little-endian-host, and
//! stable — the header's `magic` and feature words gate compatibility.

/// Sentinel in the ring header identifying an aring completion ring.
pub const RING_MAGIC: u32 = 0xa10a_10a1;

/// `compat_features` bit 0: the basic ring ABI described here.
pub const COMPAT_BASE: u32 = 1 << 0;
/// `compat_features` bit 1: the worker-thread fallback path is available.
pub const COMPAT_WORKER: u32 = 1 << 1;
/// No incompatible features are currently defined.
pub const INCOMPAT_FEATURES: u32 = 0;

/// Value written into [`IoReq::key`] when a descriptor is accepted.
/// Checked again on cancellation lookup.
pub const REQ_KEY: u32 = 0;

/// Descriptor flags.
pub mod req_flags {
    /// Deliver one eventfd increment per completion to [`super::IoReq::resfd`].
    pub const RESFD: u32 = 1 << 0;
}

/// Operation codes accepted in [`IoReq::opcode`].
///
/// Values 4 and 6 are reserved holes with no dispatch entry; submitting
/// them fails with `InvalidArgument` like any out-of-table opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Positioned read into a single buffer.
    Pread = 0,
    /// Positioned write from a single buffer.
    Pwrite = 1,
    /// Flush file data and metadata.
    Fsync = 2,
    /// Flush file data only.
    Fdsync = 3,
    /// Wait until a poll mask raises.
    Poll = 5,
    /// Positioned scatter read (`buf` points at an iovec array).
    Preadv = 7,
    /// Positioned gather write (`buf` points at an iovec array).
    Pwritev = 8,
    /// Open relative to a directory fd; result is the new fd.
    Openat = 9,
    /// Unlink relative to a directory fd.
    Unlinkat = 10,
    /// Rename; `buf` points at a [`RenameInfo`].
    Renameat = 11,
    /// Populate the page cache; result is bytes brought in.
    Readahead = 12,
}

impl Opcode {
    /// Decode a descriptor opcode. `None` for reserved or unknown values.
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::Pread,
            1 => Self::Pwrite,
            2 => Self::Fsync,
            3 => Self::Fdsync,
            5 => Self::Poll,
            7 => Self::Preadv,
            8 => Self::Pwritev,
            9 => Self::Openat,
            10 => Self::Unlinkat,
            11 => Self::Renameat,
            12 => Self::Readahead,
            _ => return None,
        })
    }

    /// Whether this opcode transfers data and may use a native backend.
    pub fn is_rw(self) -> bool {
        matches!(
            self,
            Self::Pread | Self::Pwrite | Self::Preadv | Self::Pwritev
        )
    }
}

/// A request descriptor, 64 bytes, read from caller memory by `submit`.
///
/// Per-opcode field use:
///
/// | opcode      | `buf`             | `nbytes`        | `offset`              |
/// |-------------|-------------------|-----------------|-----------------------|
/// | PREAD/PWRITE| buffer            | byte count      | file offset           |
/// | PREADV/..V  | iovec array       | iovec count     | file offset           |
/// | FSYNC/FDSYNC| —                 | —               | —                     |
/// | POLL        | event mask (u16)  | —               | —                     |
/// | OPENAT      | path              | —               | flags lo32 / mode hi32|
/// | UNLINKAT    | path              | —               | must be 0             |
/// | RENAMEAT    | [`RenameInfo`]    | info size       | must be 0             |
/// | READAHEAD   | must be 0         | byte count      | file offset           |
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct IoReq {
    /// Caller cookie, echoed into [`CompletionRecord::data`].
    pub data: u64,
    /// Written by the service at submit time; must match [`REQ_KEY`] on cancel.
    pub key: u32,
    /// Must be zero.
    pub reserved1: u32,
    /// One of the [`Opcode`] values.
    pub opcode: u16,
    /// Accepted and ignored.
    pub prio: i16,
    /// File descriptor (or directory fd for path-based operations).
    pub fd: u32,
    pub buf: u64,
    pub nbytes: u64,
    pub offset: i64,
    /// Must be zero.
    pub reserved2: u64,
    /// See [`req_flags`].
    pub flags: u32,
    /// Eventfd to signal per completion when [`req_flags::RESFD`] is set.
    pub resfd: u32,
}

impl IoReq {
    pub fn zeroed() -> Self {
        Self {
            data: 0,
            key: 0,
            reserved1: 0,
            opcode: 0,
            prio: 0,
            fd: 0,
            buf: 0,
            nbytes: 0,
            offset: 0,
            reserved2: 0,
            flags: 0,
            resfd: 0,
        }
    }
}

/// One completion, 32 bytes, written into the shared ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CompletionRecord {
    /// Echo of the caller's descriptor pointer.
    pub obj: u64,
    /// Echo of the caller's [`IoReq::data`] cookie.
    pub data: u64,
    /// Primary result: bytes transferred, raised mask, new fd, or a
    /// negative errno.
    pub res: i64,
    /// Secondary result, currently always zero.
    pub res2: i64,
}

impl CompletionRecord {
    pub fn zeroed() -> Self {
        Self {
            obj: 0,
            data: 0,
            res: 0,
            res2: 0,
        }
    }
}

/// The ring header at the start of page 0 of the shared mapping.
///
/// `head` is advanced by the consumer (the caller directly, or the
/// service's reap path on its behalf) and is therefore untrusted input
/// on the service side. `tail` is advanced only by the service under
/// its completion lock. Both are read modulo `nr`; `head == tail`
/// means empty. The first record begins `header_length` bytes into
/// page 0 and records never straddle a page boundary.
#[derive(Debug)]
#[repr(C)]
pub struct RingHeader {
    /// Registry slot of the owning context, echoed for handle lookup.
    pub id: u32,
    /// Ring capacity in records (advisory copy; the service trusts its own).
    pub nr: u32,
    pub head: u32,
    pub tail: u32,
    pub magic: u32,
    pub compat_features: u32,
    pub incompat_features: u32,
    /// Bytes before the first record in page 0.
    pub header_length: u32,
}

/// Rename parameters, pointed to by `buf` for [`Opcode::Renameat`].
/// The descriptor's `nbytes` must equal `size_of::<RenameInfo>()`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RenameInfo {
    pub oldpath: u64,
    pub newpath: u64,
    pub olddirfd: i32,
    pub newdirfd: i32,
    pub flags: u32,
}
