//! # aring-core — Types and trait seams for the aring I/O service
//!
//! This crate defines the wire ABI shared between the service and its
//! callers (request descriptors, completion records, the ring header)
//! and the trait boundaries toward the two external collaborators the
//! service executes operations through:
//!
//! - [`backend::NativeIo`] — a filesystem backend offering a true
//!   asynchronous path for data transfers.
//! - [`executor::WorkerExecutor`] — a thread pool that runs blocking
//!   fallback operations.
//!
//! Every component of the service depends on types from this crate,
//! never the other way around. Swapping a collaborator is a type
//! parameter or a `Box<dyn Trait>` swap.

pub mod backend;
pub mod entry;
pub mod error;
pub mod executor;
