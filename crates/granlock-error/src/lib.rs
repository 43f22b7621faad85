//! Error surface of the granlock lock manager.
//!
//! Every fallible public operation returns one of the four caller-contract
//! violations below. They are raised before any table mutation, so a
//! failed call leaves the lock manager exactly as it was. Being blocked on
//! a queue is *not* an error, and internal bookkeeping corruption is a
//! defect that panics rather than surfacing here.

use granlock_types::{ResourceName, TxnId};
use thiserror::Error;

/// A caller-contract violation reported by the lock manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The transaction already holds a lock on the resource (and is not
    /// releasing it as part of the same operation).
    #[error("{txn} already holds a lock on {resource}")]
    DuplicateLockRequest {
        txn: TxnId,
        resource: ResourceName,
    },

    /// The transaction holds no lock on a resource the operation needs
    /// one on.
    #[error("{txn} holds no lock on {resource}")]
    NoLockHeld {
        txn: TxnId,
        resource: ResourceName,
    },

    /// The request is malformed with respect to the locking protocol:
    /// an illegal promotion, a violated hierarchy constraint, or a
    /// redundant acquisition.
    #[error("invalid lock request on {resource}: {reason}")]
    InvalidLock {
        resource: ResourceName,
        reason: String,
    },

    /// The operation is not available on this resource (e.g. the context
    /// is read-only).
    #[error("unsupported operation on {resource}: {reason}")]
    Unsupported {
        resource: ResourceName,
        reason: String,
    },
}

impl LockError {
    /// Create an [`InvalidLock`](Self::InvalidLock) error.
    pub fn invalid(resource: ResourceName, reason: impl Into<String>) -> Self {
        Self::InvalidLock {
            resource,
            reason: reason.into(),
        }
    }

    /// Create an [`Unsupported`](Self::Unsupported) error.
    pub fn unsupported(resource: ResourceName, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            resource,
            reason: reason.into(),
        }
    }

    /// The resource the rejected operation was aimed at.
    #[must_use]
    pub fn resource(&self) -> &ResourceName {
        match self {
            Self::DuplicateLockRequest { resource, .. }
            | Self::NoLockHeld { resource, .. }
            | Self::InvalidLock { resource, .. }
            | Self::Unsupported { resource, .. } => resource,
        }
    }
}

/// Result type alias using [`LockError`].
pub type Result<T> = std::result::Result<T, LockError>;
