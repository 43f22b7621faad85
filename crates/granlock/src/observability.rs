//! Lock-contention analytics.
//!
//! Observation is opt-in through the [`LockObserver`] trait; when no
//! observer is registered, emission is a no-op branch. Every emitted event
//! also goes through `tracing` with structured fields, so hosts get
//! structured logs even without an observer. Observers are called on the
//! lock-acquisition hot path and must not block or re-enter the lock
//! manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use granlock_types::{LockMode, ResourceName, TxnId};

/// Optional observer handle. When `None`, no callback overhead.
pub type SharedObserver = Option<Arc<dyn LockObserver>>;

/// A single event emitted by the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LockEvent {
    /// A request could not be granted and was queued.
    Contention {
        /// The contended resource.
        resource: ResourceName,
        /// The transaction whose request was queued.
        requester: TxnId,
        /// A transaction currently holding an incompatible lock, if the
        /// denial came from a held lock rather than queue order.
        holder: Option<TxnId>,
        /// The mode that was requested.
        requested: LockMode,
    },

    /// A transaction's subtree was coarsened into a single lock.
    Escalated {
        /// The context the subtree was coarsened to.
        resource: ResourceName,
        /// The escalating transaction.
        txn: TxnId,
        /// The resulting mode (`S` or `X`).
        target: LockMode,
        /// Number of descendant locks that were folded in.
        released: usize,
    },
}

/// Observer trait for lock events.
///
/// Implementations MUST be non-blocking and MUST NOT call back into the
/// lock manager.
pub trait LockObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &LockEvent);
}

/// No-op observer. Default when observability is not configured.
#[derive(Debug, Clone, Copy)]
pub struct NoOpObserver;

impl LockObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &LockEvent) {}
}

/// Observer that records every event, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LockEvent>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events seen so far, in emission order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LockEvent> {
        self.events.lock().clone()
    }
}

impl LockObserver for RecordingObserver {
    fn on_event(&self, event: &LockEvent) {
        self.events.lock().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Global counters
// ---------------------------------------------------------------------------

static GRANLOCK_GRANTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static GRANLOCK_QUEUED_TOTAL: AtomicU64 = AtomicU64::new(0);
static GRANLOCK_PROMOTIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static GRANLOCK_ESCALATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static GRANLOCK_WAKEUPS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Point-in-time snapshot of the lock manager's global counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LockMetricsSnapshot {
    /// Locks granted (immediately or off a queue).
    pub grants_total: u64,
    /// Requests that had to queue.
    pub queued_total: u64,
    /// In-place promotions.
    pub promotions_total: u64,
    /// Subtree escalations.
    pub escalations_total: u64,
    /// Transactions woken by queue draining.
    pub wakeups_total: u64,
}

impl std::fmt::Display for LockMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "locks: {} granted, {} queued, {} promoted, {} escalated, {} woken",
            self.grants_total,
            self.queued_total,
            self.promotions_total,
            self.escalations_total,
            self.wakeups_total,
        )
    }
}

/// Record a grant.
pub(crate) fn record_grant() {
    GRANLOCK_GRANTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Record a queued request.
pub(crate) fn record_queued() {
    GRANLOCK_QUEUED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Record an in-place promotion.
pub(crate) fn record_promotion() {
    GRANLOCK_PROMOTIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Record an escalation.
pub(crate) fn record_escalation() {
    GRANLOCK_ESCALATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Record a queue-drain wakeup.
pub(crate) fn record_wakeup() {
    GRANLOCK_WAKEUPS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

/// Read a point-in-time snapshot of the counters.
#[must_use]
pub fn lock_metrics_snapshot() -> LockMetricsSnapshot {
    LockMetricsSnapshot {
        grants_total: GRANLOCK_GRANTS_TOTAL.load(Ordering::Relaxed),
        queued_total: GRANLOCK_QUEUED_TOTAL.load(Ordering::Relaxed),
        promotions_total: GRANLOCK_PROMOTIONS_TOTAL.load(Ordering::Relaxed),
        escalations_total: GRANLOCK_ESCALATIONS_TOTAL.load(Ordering::Relaxed),
        wakeups_total: GRANLOCK_WAKEUPS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset all counters to zero (tests/diagnostics).
pub fn reset_lock_metrics() {
    GRANLOCK_GRANTS_TOTAL.store(0, Ordering::Relaxed);
    GRANLOCK_QUEUED_TOTAL.store(0, Ordering::Relaxed);
    GRANLOCK_PROMOTIONS_TOTAL.store(0, Ordering::Relaxed);
    GRANLOCK_ESCALATIONS_TOTAL.store(0, Ordering::Relaxed);
    GRANLOCK_WAKEUPS_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Emit helpers
// ---------------------------------------------------------------------------

/// Emit to observer if present.
#[inline]
fn emit(observer: &SharedObserver, event: &LockEvent) {
    if let Some(obs) = observer {
        obs.on_event(event);
    }
}

/// Emit a contention event: `requester`'s request for `requested` on
/// `resource` was queued behind `holder` (or behind queue order when
/// `holder` is `None`).
pub(crate) fn emit_contention(
    observer: &SharedObserver,
    resource: &ResourceName,
    requester: TxnId,
    holder: Option<TxnId>,
    requested: LockMode,
) {
    tracing::debug!(
        resource = %resource,
        requester = %requester,
        holder = holder.map(|h| h.get()),
        requested = %requested,
        "lock::contention"
    );
    emit(
        observer,
        &LockEvent::Contention {
            resource: resource.clone(),
            requester,
            holder,
            requested,
        },
    );
}

/// Emit an escalation event.
pub(crate) fn emit_escalated(
    observer: &SharedObserver,
    resource: &ResourceName,
    txn: TxnId,
    target: LockMode,
    released: usize,
) {
    tracing::debug!(
        resource = %resource,
        txn = %txn,
        target = %target,
        released,
        "lock::escalated"
    );
    emit(
        observer,
        &LockEvent::Escalated {
            resource: resource.clone(),
            txn,
            target,
            released,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_observer_no_panic() {
        let shared: SharedObserver = None;
        emit_contention(
            &shared,
            &ResourceName::database(),
            TxnId::new(1),
            Some(TxnId::new(2)),
            LockMode::X,
        );
        emit_escalated(&shared, &ResourceName::database(), TxnId::new(1), LockMode::S, 3);
    }

    #[test]
    fn recording_observer_captures_events() {
        let obs = Arc::new(RecordingObserver::new());
        let shared: SharedObserver = Some(Arc::clone(&obs) as Arc<dyn LockObserver>);

        emit_contention(
            &shared,
            &ResourceName::database().child("t"),
            TxnId::new(7),
            None,
            LockMode::S,
        );

        let events = obs.snapshot();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            LockEvent::Contention { requester, holder: None, requested: LockMode::S, .. }
                if requester.get() == 7
        ));
    }

    #[test]
    fn counters_advance() {
        let before = lock_metrics_snapshot();
        record_grant();
        record_queued();
        record_wakeup();
        let after = lock_metrics_snapshot();
        assert!(after.grants_total >= before.grants_total + 1);
        assert!(after.queued_total >= before.queued_total + 1);
        assert!(after.wakeups_total >= before.wakeups_total + 1);
    }

    #[test]
    fn snapshot_display() {
        let snap = LockMetricsSnapshot {
            grants_total: 5,
            queued_total: 2,
            promotions_total: 1,
            escalations_total: 1,
            wakeups_total: 2,
        };
        assert_eq!(
            snap.to_string(),
            "locks: 5 granted, 2 queued, 1 promoted, 1 escalated, 2 woken"
        );
    }
}
