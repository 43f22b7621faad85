//! The transaction-handle seam between the lock manager and its host.
//!
//! The lock manager never suspends a thread itself; it asks the blocked
//! transaction's handle to do it. The protocol is two-phase to avoid lost
//! wakeups: `prepare_to_block` is called while the lock table's monitor is
//! still held, `block` strictly after it is released. An `unblock` that
//! lands in between must make the later `block` return immediately.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use granlock_types::TxnId;

/// What the lock manager needs from a transaction: an identity and the
/// two-phase suspension protocol.
///
/// `unblock` must be idempotent, and `block` must observe any
/// `prepare_to_block`/`unblock` pair that completed before it ran.
pub trait TransactionHandle: Send + Sync {
    /// The transaction's id.
    fn id(&self) -> TxnId;

    /// Mark the transaction as about to suspend. Called with the lock
    /// table's monitor held.
    fn prepare_to_block(&self);

    /// Suspend until [`unblock`](Self::unblock). Called with no locks held.
    /// Returns immediately if an unblock already arrived.
    fn block(&self);

    /// Wake the transaction from [`block`](Self::block).
    fn unblock(&self);
}

/// Reference [`TransactionHandle`] backed by a mutex/condvar pair.
///
/// Hosts with their own scheduler implement the trait themselves; tests
/// and simple embedders use this.
pub struct Session {
    id: TxnId,
    blocked: Mutex<bool>,
    unblocked: Condvar,
}

impl Session {
    /// Create a session for transaction `id`.
    #[must_use]
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
        }
    }

    /// Whether the session is between `prepare_to_block` and `unblock`.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

impl TransactionHandle for Session {
    fn id(&self) -> TxnId {
        self.id
    }

    fn prepare_to_block(&self) {
        let mut blocked = self.blocked.lock();
        debug_assert!(!*blocked, "{} prepared to block twice", self.id);
        *blocked = true;
    }

    fn block(&self) {
        let mut blocked = self.blocked.lock();
        while *blocked {
            self.unblocked.wait(&mut blocked);
        }
    }

    fn unblock(&self) {
        let mut blocked = self.blocked.lock();
        *blocked = false;
        self.unblocked.notify_all();
    }
}

/// Upcast a concrete session for the manager's dynamic call sites.
#[must_use]
pub fn handle_of(session: &Arc<Session>) -> Arc<dyn TransactionHandle> {
    Arc::clone(session) as Arc<dyn TransactionHandle>
}
