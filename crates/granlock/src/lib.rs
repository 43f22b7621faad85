//! Multigranularity lock manager for transactional storage engines.
//!
//! Two tightly coupled layers over one shared lock table:
//!
//! - [`LockManager`]: the flat layer. Tracks, per resource, which
//!   transactions hold which modes, detects conflicts, and runs the
//!   per-resource FIFO wait queues that block and wake transactions.
//! - [`LockContext`] + [`ensure_sufficient_lock_held`]: the hierarchy
//!   layer. Contexts mirror the resource tree (database ⊃ table ⊃ page)
//!   and enforce the Gray-style intent protocol: intent locks on
//!   ancestors, redundancy pruning, children-first release, and
//!   escalation. The facade turns "I need to read/write this" into the
//!   minimal sequence of acquisitions and promotions.
//!
//! Transactions are represented by their [`TransactionHandle`]s; blocking
//! is cooperative, two-phase, and always happens outside the lock table's
//! monitor.

pub mod context;
pub mod manager;
pub mod observability;
pub mod txn;
pub mod util;

pub use context::LockContext;
pub use manager::{Lock, LockManager};
pub use observability::{
    LockEvent, LockMetricsSnapshot, LockObserver, NoOpObserver, RecordingObserver,
    lock_metrics_snapshot, reset_lock_metrics,
};
pub use txn::{Session, TransactionHandle, handle_of};
pub use util::ensure_sufficient_lock_held;

pub use granlock_error::{LockError, Result};
pub use granlock_types::{LockMode, ResourceName, TxnId};
