//! Distributed mutual exclusion for Vesper.
//!
//! This crate provides scoped, named, time-bounded locks shared by all
//! replicas of a deployment:
//! - Ownership is coordinated through a pluggable [`LockStore`] backend
//! - A whole set of resource names is acquired atomically or not at all
//! - Locks are released on every exit path, with TTL expiry as the
//!   backstop when a process dies mid-scope
//! - Contention is reported distinctly from backend failure

mod error;
mod lock;
mod store;

pub use error::{LockError, StoreError};
pub use lock::{DistributedLock, Lease};
pub use store::{LockStore, MemoryLockStore};
