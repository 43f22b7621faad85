//! Vocabulary types shared across the granlock crates.
//!
//! This crate defines the identifiers and the lock-mode algebra the engine
//! is built on: [`TxnId`], [`ResourceName`], and [`LockMode`]. Everything
//! here is a plain value type with no runtime state.

use std::fmt;

pub mod mode;
pub mod resource;

pub use mode::LockMode;
pub use resource::ResourceName;

/// Identifier of a transaction as seen by the lock manager.
///
/// The lock manager does not allocate these; the host's transaction
/// dispatcher owns the id space and hands them in through the
/// transaction handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Wrap a raw transaction number.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

impl From<u64> for TxnId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_id_display() {
        assert_eq!(TxnId::new(42).to_string(), "txn#42");
    }

    #[test]
    fn txn_id_roundtrip() {
        let id = TxnId::from(7_u64);
        assert_eq!(id.get(), 7);
        assert_eq!(id, TxnId::new(7));
    }

    #[test]
    fn txn_id_ordering() {
        assert!(TxnId::new(1) < TxnId::new(2));
    }
}
