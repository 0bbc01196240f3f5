//! Error types for distributed locking.

use thiserror::Error;

/// Failure raised by a coordination store backend.
///
/// Backends fold their own transport or storage errors into this type,
/// so callers can tell infrastructure trouble apart from ordinary
/// contention without knowing which backend is in play.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    /// Wrap a backend failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors from scoped lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the named resource. Expected and frequent
    /// when several replicas share one coordination store.
    #[error("resource held elsewhere: {0}")]
    Contended(String),

    /// The coordination store itself was unreachable or errored.
    #[error("coordination store failure: {0}")]
    Store(#[from] StoreError),

    /// A lock scope was requested with an empty resource set.
    #[error("no resources named for lock scope")]
    NoResources,
}
