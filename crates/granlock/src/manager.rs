//! The flat lock manager: bookkeeping for which transactions hold which
//! locks on which resources, and the per-resource FIFO queueing logic.
//!
//! This layer treats every resource independently; the hierarchy is the
//! [`LockContext`](crate::context::LockContext) layer's business, and user
//! code should normally go through contexts (or
//! [`ensure_sufficient_lock_held`](crate::util::ensure_sufficient_lock_held))
//! rather than calling the manager directly.
//!
//! All mutable state lives in one [`LockTable`] behind a single mutex, the
//! lock table's monitor. Requests that cannot be granted are queued on the
//! resource and the transaction is suspended through its handle. The
//! monitor is always released before the suspension happens, and wakeups
//! collected while draining a queue are delivered after it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use granlock_error::{LockError, Result};
use granlock_types::{LockMode, ResourceName, TxnId};

use crate::context::{ContextArena, LockContext};
use crate::observability::{self, SharedObserver};
use crate::txn::TransactionHandle;

/// A granted lock: `txn` holds `mode` on `resource`. The mode is never
/// `NL`; absence of a lock is represented by absence of the `Lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    /// The locked resource.
    pub resource: ResourceName,
    /// The held mode.
    pub mode: LockMode,
    /// The holding transaction.
    pub txn: TxnId,
}

/// A queued proposal: grant `lock`, then release the same transaction's
/// locks on `release_after` in the same atomic step.
struct LockRequest {
    handle: Arc<dyn TransactionHandle>,
    lock: Lock,
    release_after: Vec<ResourceName>,
}

/// Per-resource lock state: the granted locks in acquisition order, and
/// the FIFO queue of requests that could not be granted yet.
#[derive(Default)]
struct ResourceEntry {
    granted: SmallVec<[Lock; 4]>,
    wait_queue: VecDeque<LockRequest>,
}

/// Handles of transactions to wake once the monitor is released.
pub(crate) type Woken = Vec<Arc<dyn TransactionHandle>>;

/// Everything the monitor guards: the per-resource entries, the reverse
/// index from transactions to their locks (in acquisition order), and the
/// context tree's bookkeeping.
pub(crate) struct LockTable {
    entries: HashMap<ResourceName, ResourceEntry>,
    txn_locks: HashMap<TxnId, Vec<Lock>>,
    pub(crate) contexts: ContextArena,
}

impl LockTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            txn_locks: HashMap::new(),
            contexts: ContextArena::new(),
        }
    }

    /// The mode `txn` holds on `name`, or `NL`.
    pub(crate) fn mode_of(&self, txn: TxnId, name: &ResourceName) -> LockMode {
        self.entries.get(name).map_or(LockMode::NL, |entry| {
            entry
                .granted
                .iter()
                .find(|lock| lock.txn == txn)
                .map_or(LockMode::NL, |lock| lock.mode)
        })
    }

    /// Whether `mode` is compatible with every granted lock on `name`,
    /// ignoring locks held by `except` (a transaction never conflicts
    /// with itself; this is what lets it replace its own lock).
    fn check_compatible(&self, name: &ResourceName, mode: LockMode, except: TxnId) -> bool {
        self.entries.get(name).map_or(true, |entry| {
            entry
                .granted
                .iter()
                .all(|lock| lock.txn == except || lock.mode.compatible(mode))
        })
    }

    /// First transaction (other than `except`) whose granted lock on
    /// `name` conflicts with `mode`.
    fn conflicting_holder(
        &self,
        name: &ResourceName,
        mode: LockMode,
        except: TxnId,
    ) -> Option<TxnId> {
        self.entries.get(name).and_then(|entry| {
            entry
                .granted
                .iter()
                .find(|lock| lock.txn != except && !lock.mode.compatible(mode))
                .map(|lock| lock.txn)
        })
    }

    /// All locks `txn` holds on strict descendants of `name`, in
    /// acquisition order.
    pub(crate) fn descendant_locks(
        &self,
        txn: TxnId,
        name: &ResourceName,
    ) -> Vec<(ResourceName, LockMode)> {
        self.txn_locks.get(&txn).map_or_else(Vec::new, |locks| {
            locks
                .iter()
                .filter(|lock| lock.resource.is_descendant_of(name))
                .map(|lock| (lock.resource.clone(), lock.mode))
                .collect()
        })
    }

    /// Nearest strict ancestor of `name` on which `txn` holds `S` or
    /// `SIX`, i.e. an ancestor that already grants shared access to the
    /// whole subtree.
    pub(crate) fn shared_ancestor(&self, txn: TxnId, name: &ResourceName) -> Option<ResourceName> {
        let mut cursor = name.parent();
        while let Some(ancestor) = cursor {
            if matches!(self.mode_of(txn, &ancestor), LockMode::S | LockMode::SIX) {
                return Some(ancestor);
            }
            cursor = ancestor.parent();
        }
        None
    }

    /// Grant `lock`, updating in place (same position in the granted list
    /// and in the transaction's lock list) if the transaction already
    /// holds a lock on the resource. Keeps the reverse index and the
    /// context counters in sync. The caller has already checked
    /// compatibility.
    fn grant_or_update(&mut self, lock: Lock) {
        let entry = self.entries.entry(lock.resource.clone()).or_default();
        if let Some(held) = entry.granted.iter_mut().find(|held| held.txn == lock.txn) {
            held.mode = lock.mode;
            self.txn_locks
                .get_mut(&lock.txn)
                .and_then(|locks| {
                    locks
                        .iter_mut()
                        .find(|held| held.resource == lock.resource)
                })
                .expect("granted lock missing from the transaction index")
                .mode = lock.mode;
        } else {
            entry.granted.push(lock.clone());
            self.txn_locks
                .entry(lock.txn)
                .or_default()
                .push(lock.clone());
            self.contexts.note_granted(&lock.resource, lock.txn);
        }
        debug!(resource = %lock.resource, txn = %lock.txn, mode = %lock.mode, "lock::granted");
    }

    /// Remove the lock `txn` holds on `name`, if any, keeping the reverse
    /// index and the context counters in sync.
    fn remove_granted(&mut self, txn: TxnId, name: &ResourceName) -> Option<Lock> {
        let entry = self.entries.get_mut(name)?;
        let position = entry.granted.iter().position(|lock| lock.txn == txn)?;
        let lock = entry.granted.remove(position);
        if let Some(locks) = self.txn_locks.get_mut(&txn) {
            if let Some(index) = locks.iter().position(|held| held.resource == *name) {
                locks.remove(index);
            }
            if locks.is_empty() {
                self.txn_locks.remove(&txn);
            }
        }
        self.contexts.note_released(name, txn);
        debug!(resource = %name, txn = %txn, mode = %lock.mode, "lock::released");
        Some(lock)
    }

    /// Drain `name`'s queue from the head: grant the head while it is
    /// compatible with the granted set (its own locks excluded), perform
    /// its paired releases, and collect its handle for waking. Stops at
    /// the first head that cannot be granted; a compatible request
    /// behind an incompatible head stays queued.
    ///
    /// Paired releases cascade into the drained resources' own queues, so
    /// the granted sets seen here can change between iterations; the head
    /// is re-checked every time rather than iterating the queue.
    fn drain_queue(&mut self, name: &ResourceName, woken: &mut Woken) {
        loop {
            let Some((mode, txn)) = self.entries.get(name).and_then(|entry| {
                entry
                    .wait_queue
                    .front()
                    .map(|head| (head.lock.mode, head.lock.txn))
            }) else {
                return;
            };
            if !self.check_compatible(name, mode, txn) {
                return;
            }

            let request = self
                .entries
                .get_mut(name)
                .and_then(|entry| entry.wait_queue.pop_front())
                .expect("queue head disappeared under the monitor");
            self.grant_or_update(request.lock.clone());
            observability::record_grant();

            for released in &request.release_after {
                if released == name {
                    // The entry named ourselves: that is the lock that was
                    // just replaced in place, not something to un-grant.
                    continue;
                }
                if self.remove_granted(request.lock.txn, released).is_some() {
                    self.drain_queue(released, woken);
                }
            }

            observability::record_wakeup();
            woken.push(Arc::clone(&request.handle));
        }
    }

    /// Grant-or-queue logic behind [`LockManager::acquire`]. Returns
    /// whether the caller must block.
    pub(crate) fn acquire_locked(
        &mut self,
        handle: &Arc<dyn TransactionHandle>,
        name: &ResourceName,
        mode: LockMode,
        observer: &SharedObserver,
    ) -> Result<bool> {
        let txn = handle.id();
        if mode == LockMode::NL {
            return Err(LockError::invalid(
                name.clone(),
                "cannot acquire an NL lock; release instead",
            ));
        }
        if self.mode_of(txn, name) != LockMode::NL {
            return Err(LockError::DuplicateLockRequest {
                txn,
                resource: name.clone(),
            });
        }

        let queue_occupied = self
            .entries
            .get(name)
            .is_some_and(|entry| !entry.wait_queue.is_empty());
        // A non-empty queue always wins, even when the new request would
        // be compatible: bypassing it would let a stream of readers
        // starve a queued writer.
        if queue_occupied || !self.check_compatible(name, mode, txn) {
            let holder = self.conflicting_holder(name, mode, txn);
            observability::emit_contention(observer, name, txn, holder, mode);
            observability::record_queued();
            handle.prepare_to_block();
            self.entries
                .entry(name.clone())
                .or_default()
                .wait_queue
                .push_back(LockRequest {
                    handle: Arc::clone(handle),
                    lock: Lock {
                        resource: name.clone(),
                        mode,
                        txn,
                    },
                    release_after: Vec::new(),
                });
            return Ok(true);
        }

        self.grant_or_update(Lock {
            resource: name.clone(),
            mode,
            txn,
        });
        observability::record_grant();
        Ok(false)
    }

    /// Removal-and-drain logic behind [`LockManager::release`].
    pub(crate) fn release_locked(
        &mut self,
        txn: TxnId,
        name: &ResourceName,
        woken: &mut Woken,
    ) -> Result<()> {
        if self.mode_of(txn, name) == LockMode::NL {
            return Err(LockError::NoLockHeld {
                txn,
                resource: name.clone(),
            });
        }
        self.remove_granted(txn, name)
            .expect("held lock disappeared under the monitor");
        self.drain_queue(name, woken);
        Ok(())
    }

    /// In-place promotion logic behind [`LockManager::promote`]. Returns
    /// whether the caller must block.
    pub(crate) fn promote_locked(
        &mut self,
        handle: &Arc<dyn TransactionHandle>,
        name: &ResourceName,
        new_mode: LockMode,
        observer: &SharedObserver,
    ) -> Result<bool> {
        let txn = handle.id();
        let held = self.mode_of(txn, name);
        if held == LockMode::NL {
            return Err(LockError::NoLockHeld {
                txn,
                resource: name.clone(),
            });
        }
        if held == new_mode {
            return Err(LockError::DuplicateLockRequest {
                txn,
                resource: name.clone(),
            });
        }
        if new_mode == LockMode::SIX {
            // SIX makes the transaction's descendant S/IS locks redundant;
            // they must be dropped in the same atomic step, which only
            // acquire-and-release can express.
            return Err(LockError::invalid(
                name.clone(),
                "promotion to SIX must go through acquire_and_release",
            ));
        }
        if !new_mode.substitutes(held) {
            return Err(LockError::invalid(
                name.clone(),
                format!("{new_mode} is not a promotion of {held}"),
            ));
        }

        if self.check_compatible(name, new_mode, txn) {
            self.grant_or_update(Lock {
                resource: name.clone(),
                mode: new_mode,
                txn,
            });
            observability::record_promotion();
            return Ok(false);
        }

        let holder = self.conflicting_holder(name, new_mode, txn);
        observability::emit_contention(observer, name, txn, holder, new_mode);
        observability::record_queued();
        handle.prepare_to_block();
        // Promotions go to the front: the transaction already holds a lock
        // here and queueing it at the back behind its own blockers would
        // deadlock against FIFO order.
        self.entries
            .entry(name.clone())
            .or_default()
            .wait_queue
            .push_front(LockRequest {
                handle: Arc::clone(handle),
                lock: Lock {
                    resource: name.clone(),
                    mode: new_mode,
                    txn,
                },
                release_after: Vec::new(),
            });
        Ok(true)
    }

    /// Atomic grant-plus-releases logic behind
    /// [`LockManager::acquire_and_release`]. Returns whether the caller
    /// must block.
    pub(crate) fn acquire_and_release_locked(
        &mut self,
        handle: &Arc<dyn TransactionHandle>,
        name: &ResourceName,
        mode: LockMode,
        release_names: &[ResourceName],
        observer: &SharedObserver,
        woken: &mut Woken,
    ) -> Result<bool> {
        let txn = handle.id();
        if mode == LockMode::NL {
            return Err(LockError::invalid(
                name.clone(),
                "cannot acquire an NL lock; release instead",
            ));
        }

        let mut release: Vec<ResourceName> = release_names.to_vec();
        release.sort();
        release.dedup();
        for released in &release {
            if self.mode_of(txn, released) == LockMode::NL {
                return Err(LockError::NoLockHeld {
                    txn,
                    resource: released.clone(),
                });
            }
        }
        let replacing_self = release.binary_search(name).is_ok();
        if self.mode_of(txn, name) == mode && !replacing_self {
            return Err(LockError::DuplicateLockRequest {
                txn,
                resource: name.clone(),
            });
        }

        if self.check_compatible(name, mode, txn) {
            self.grant_or_update(Lock {
                resource: name.clone(),
                mode,
                txn,
            });
            observability::record_grant();
            for released in &release {
                if released == name {
                    continue;
                }
                self.remove_granted(txn, released)
                    .expect("release target disappeared under the monitor");
                self.drain_queue(released, woken);
            }
            if replacing_self {
                // Replacing our own lock may have weakened it; the queue
                // may now be grantable.
                self.drain_queue(name, woken);
            }
            return Ok(false);
        }

        let holder = self.conflicting_holder(name, mode, txn);
        observability::emit_contention(observer, name, txn, holder, mode);
        observability::record_queued();
        handle.prepare_to_block();
        self.entries
            .entry(name.clone())
            .or_default()
            .wait_queue
            .push_front(LockRequest {
                handle: Arc::clone(handle),
                lock: Lock {
                    resource: name.clone(),
                    mode,
                    txn,
                },
                release_after: release,
            });
        Ok(true)
    }
}

/// The lock manager. One instance coordinates all transactions of a
/// storage engine; clone the [`Arc`] to share it.
pub struct LockManager {
    pub(crate) state: Mutex<LockTable>,
    observer: SharedObserver,
}

impl LockManager {
    /// Create a lock manager with no observer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockTable::new()),
            observer: None,
        }
    }

    /// Create a lock manager that reports contention and escalation
    /// events to `observer`.
    #[must_use]
    pub fn with_observer(observer: Arc<dyn crate::observability::LockObserver>) -> Self {
        Self {
            state: Mutex::new(LockTable::new()),
            observer: Some(observer),
        }
    }

    pub(crate) fn observer(&self) -> &SharedObserver {
        &self.observer
    }

    /// Acquire a `mode` lock on `name` for the calling transaction.
    ///
    /// Grants immediately when `name`'s queue is empty and `mode` is
    /// compatible with the granted set; otherwise queues the request at
    /// the back and blocks until it is granted.
    ///
    /// # Errors
    ///
    /// [`LockError::DuplicateLockRequest`] if the transaction already
    /// holds a lock on `name` (implicit upgrades are not allowed; see
    /// [`promote`](Self::promote)); [`LockError::InvalidLock`] if `mode`
    /// is `NL`.
    pub fn acquire(
        &self,
        handle: &Arc<dyn TransactionHandle>,
        name: &ResourceName,
        mode: LockMode,
    ) -> Result<()> {
        let should_block = self
            .state
            .lock()
            .acquire_locked(handle, name, mode, &self.observer)?;
        if should_block {
            handle.block();
        }
        Ok(())
    }

    /// Release `txn`'s lock on `name` and drain the resource's queue.
    ///
    /// # Errors
    ///
    /// [`LockError::NoLockHeld`] if `txn` holds no lock on `name`.
    pub fn release(&self, txn: TxnId, name: &ResourceName) -> Result<()> {
        let mut woken = Woken::new();
        self.state.lock().release_locked(txn, name, &mut woken)?;
        for handle in woken {
            handle.unblock();
        }
        Ok(())
    }

    /// Promote the calling transaction's lock on `name` to `new_mode` in
    /// place, preserving its acquisition order.
    ///
    /// If `new_mode` conflicts with another holder, the request is queued
    /// at the *front* of the resource's queue and the caller blocks.
    ///
    /// # Errors
    ///
    /// [`LockError::NoLockHeld`] if no lock is held;
    /// [`LockError::DuplicateLockRequest`] if `new_mode` is already held;
    /// [`LockError::InvalidLock`] if `new_mode` does not substitute the
    /// held mode, or is `SIX` (which must go through
    /// [`acquire_and_release`](Self::acquire_and_release)).
    pub fn promote(
        &self,
        handle: &Arc<dyn TransactionHandle>,
        name: &ResourceName,
        new_mode: LockMode,
    ) -> Result<()> {
        let should_block = self
            .state
            .lock()
            .promote_locked(handle, name, new_mode, &self.observer)?;
        if should_block {
            handle.block();
        }
        Ok(())
    }

    /// Acquire (or replace in place) a `mode` lock on `name`, then release
    /// the calling transaction's locks on `release_names`, as one atomic
    /// step: no other transaction ever observes the grant without the
    /// releases or vice versa.
    ///
    /// `release_names` may contain `name` itself, which expresses in-place
    /// replacement of the existing lock (keeping its acquisition order).
    /// Compatibility on `name` ignores the transaction's own locks. If the
    /// grant must wait, the request carries its releases to the *front* of
    /// the queue and the caller blocks.
    ///
    /// # Errors
    ///
    /// [`LockError::NoLockHeld`] if the transaction does not hold a lock
    /// on every resource in `release_names`;
    /// [`LockError::DuplicateLockRequest`] if it already holds `mode` on
    /// `name` and `name` is not being released;
    /// [`LockError::InvalidLock`] if `mode` is `NL`.
    pub fn acquire_and_release(
        &self,
        handle: &Arc<dyn TransactionHandle>,
        name: &ResourceName,
        mode: LockMode,
        release_names: &[ResourceName],
    ) -> Result<()> {
        let mut woken = Woken::new();
        let should_block = self.state.lock().acquire_and_release_locked(
            handle,
            name,
            mode,
            release_names,
            &self.observer,
            &mut woken,
        )?;
        for handle in woken {
            handle.unblock();
        }
        if should_block {
            handle.block();
        }
        Ok(())
    }

    /// Remove every trace of `txn`: queued requests, granted locks, and
    /// context counters. Affected queues are drained and newly grantable
    /// waiters woken. The host calls this when it aborts a transaction
    /// (for instance to break a deadlock); if the transaction was blocked,
    /// its pending operation completes without a grant.
    pub fn release_all(&self, txn: TxnId) {
        let mut woken = Woken::new();
        {
            let mut table = self.state.lock();
            let mut vacated: Vec<ResourceName> = Vec::new();
            for (name, entry) in &mut table.entries {
                let before = entry.wait_queue.len();
                entry.wait_queue.retain(|request| {
                    if request.lock.txn == txn {
                        woken.push(Arc::clone(&request.handle));
                        false
                    } else {
                        true
                    }
                });
                if entry.wait_queue.len() != before {
                    vacated.push(name.clone());
                }
            }
            let mut held: Vec<ResourceName> = table
                .txn_locks
                .get(&txn)
                .map_or_else(Vec::new, |locks| {
                    locks.iter().map(|lock| lock.resource.clone()).collect()
                });
            held.sort();
            for name in &held {
                table
                    .remove_granted(txn, name)
                    .expect("held lock disappeared under the monitor");
                table.drain_queue(name, &mut woken);
            }
            // A removed queue entry may have been the head holding back
            // compatible requests behind it.
            vacated.sort();
            for name in &vacated {
                table.drain_queue(name, &mut woken);
            }
            table.contexts.forget_txn(txn);
        }
        debug!(txn = %txn, "lock::release_all");
        for handle in woken {
            handle.unblock();
        }
    }

    /// The mode `txn` holds on `name`, or `NL`.
    #[must_use]
    pub fn get_lock_mode(&self, txn: TxnId, name: &ResourceName) -> LockMode {
        self.state.lock().mode_of(txn, name)
    }

    /// Snapshot of the locks granted on `name`, in acquisition order.
    #[must_use]
    pub fn locks_on(&self, name: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .entries
            .get(name)
            .map_or_else(Vec::new, |entry| entry.granted.to_vec())
    }

    /// Snapshot of the locks `txn` holds, in acquisition order.
    #[must_use]
    pub fn locks_of(&self, txn: TxnId) -> Vec<Lock> {
        self.state
            .lock()
            .txn_locks
            .get(&txn)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of requests waiting on `name`.
    #[must_use]
    pub fn queue_length(&self, name: &ResourceName) -> usize {
        self.state
            .lock()
            .entries
            .get(name)
            .map_or(0, |entry| entry.wait_queue.len())
    }

    /// Total granted locks across all resources.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .map(|entry| entry.granted.len())
            .sum()
    }

    /// The context for `name`, creating it (and its ancestors) on first
    /// reference.
    #[must_use]
    pub fn context(self: &Arc<Self>, name: &ResourceName) -> LockContext {
        self.state.lock().contexts.ensure(name);
        LockContext::new(Arc::clone(self), name.clone())
    }

    /// The context for the conventional `database` root.
    #[must_use]
    pub fn database_context(self: &Arc<Self>) -> LockContext {
        self.context(&ResourceName::database())
    }

    /// Panic if the lock table's bookkeeping disagrees with itself:
    /// granted sets must be pairwise compatible, hold one lock per
    /// transaction, mirror the reverse index exactly, and match the
    /// context layer's descendant counters.
    pub fn assert_invariants(&self) {
        let table = self.state.lock();
        for (name, entry) in &table.entries {
            for (i, a) in entry.granted.iter().enumerate() {
                assert_eq!(&a.resource, name, "lock filed under the wrong resource");
                assert_ne!(a.mode, LockMode::NL, "NL lock stored in the table");
                for b in entry.granted.iter().skip(i + 1) {
                    assert_ne!(a.txn, b.txn, "{} holds two locks on {name}", a.txn);
                    assert!(
                        a.mode.compatible(b.mode),
                        "incompatible locks granted on {name}: {} {} vs {} {}",
                        a.txn,
                        a.mode,
                        b.txn,
                        b.mode
                    );
                }
                let mirrored = table
                    .txn_locks
                    .get(&a.txn)
                    .and_then(|locks| locks.iter().find(|l| l.resource == *name));
                assert_eq!(mirrored, Some(a), "transaction index out of sync on {name}");
            }
        }
        for (txn, locks) in &table.txn_locks {
            assert!(!locks.is_empty(), "empty lock list retained for {txn}");
            for lock in locks {
                assert_eq!(&lock.txn, txn, "lock filed under the wrong transaction");
                let granted = table
                    .entries
                    .get(&lock.resource)
                    .map_or(false, |entry| entry.granted.contains(lock));
                assert!(granted, "{txn} indexes a lock not granted on {}", lock.resource);
            }
        }
        table.contexts.assert_counts(&table.txn_locks);
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.state.lock();
        let queued: usize = table.entries.values().map(|e| e.wait_queue.len()).sum();
        let granted: usize = table.entries.values().map(|e| e.granted.len()).sum();
        f.debug_struct("LockManager")
            .field("resources", &table.entries.len())
            .field("granted", &granted)
            .field("queued", &queued)
            .finish_non_exhaustive()
    }
}
