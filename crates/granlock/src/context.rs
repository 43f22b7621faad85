//! The multigranularity layer: one context per resource, arranged in a
//! tree mirroring the resource hierarchy.
//!
//! Contexts add the intent-lock protocol on top of the flat
//! [`LockManager`](crate::manager::LockManager): a lock on a context is
//! only legal if the same transaction holds a sufficient intent lock on
//! the parent, shared locks below a shared ancestor are rejected as
//! redundant, releases go children-first, and a transaction's fine-grained
//! locks in a subtree can be coarsened into one lock via
//! [`escalate`](LockContext::escalate).
//!
//! A [`LockContext`] value is a cheap handle; the tree's bookkeeping (the
//! per-transaction descendant-lock counters, read-only flags, capacities)
//! lives in the [`ContextArena`] inside the manager's state, under the
//! same monitor as the lock table itself.

use std::collections::HashMap;
use std::sync::Arc;

use granlock_error::{LockError, Result};
use granlock_types::{LockMode, ResourceName, TxnId};

use crate::manager::{Lock, LockManager, Woken};
use crate::observability;
use crate::txn::TransactionHandle;

/// One node of the context tree.
struct ContextNode {
    name: ResourceName,
    parent: Option<usize>,
    readonly: bool,
    child_locks_disabled: bool,
    capacity: Option<usize>,
    /// Per transaction: number of descendant contexts on which it holds
    /// a lock. Maintained by the lock table on every grant and release.
    child_locks: HashMap<TxnId, usize>,
}

/// The context tree's bookkeeping, owned by the manager state. Nodes are
/// allocated on first reference and never removed; parents are indices
/// into the same arena.
pub(crate) struct ContextArena {
    nodes: Vec<ContextNode>,
    index: HashMap<ResourceName, usize>,
}

impl ContextArena {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Index of `name`'s node, creating it and its ancestors if needed.
    /// A node created under a parent with child locks disabled starts out
    /// read-only.
    pub(crate) fn ensure(&mut self, name: &ResourceName) -> usize {
        if let Some(&existing) = self.index.get(name) {
            return existing;
        }
        let parent = name.parent().map(|parent_name| self.ensure(&parent_name));
        let readonly = parent.is_some_and(|p| self.nodes[p].child_locks_disabled);
        let node = ContextNode {
            name: name.clone(),
            parent,
            readonly,
            child_locks_disabled: false,
            capacity: None,
            child_locks: HashMap::new(),
        };
        let index = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(name.clone(), index);
        index
    }

    /// Bump every ancestor's counter for a fresh grant on `name`.
    pub(crate) fn note_granted(&mut self, name: &ResourceName, txn: TxnId) {
        let node = self.ensure(name);
        let mut cursor = self.nodes[node].parent;
        while let Some(index) = cursor {
            *self.nodes[index].child_locks.entry(txn).or_insert(0) += 1;
            cursor = self.nodes[index].parent;
        }
    }

    /// Undo [`note_granted`](Self::note_granted) for a release on `name`.
    pub(crate) fn note_released(&mut self, name: &ResourceName, txn: TxnId) {
        let node = self.ensure(name);
        let mut cursor = self.nodes[node].parent;
        while let Some(index) = cursor {
            let count = self.nodes[index]
                .child_locks
                .get_mut(&txn)
                .expect("descendant counter missing on release");
            *count -= 1;
            if *count == 0 {
                self.nodes[index].child_locks.remove(&txn);
            }
            cursor = self.nodes[index].parent;
        }
    }

    /// Drop all counters for `txn` (transaction torn down externally).
    pub(crate) fn forget_txn(&mut self, txn: TxnId) {
        for node in &mut self.nodes {
            node.child_locks.remove(&txn);
        }
    }

    fn node(&self, name: &ResourceName) -> Option<&ContextNode> {
        self.index.get(name).map(|&index| &self.nodes[index])
    }

    pub(crate) fn is_readonly(&self, name: &ResourceName) -> bool {
        self.node(name).is_some_and(|node| node.readonly)
    }

    pub(crate) fn child_lock_count(&self, name: &ResourceName, txn: TxnId) -> usize {
        self.node(name)
            .and_then(|node| node.child_locks.get(&txn).copied())
            .unwrap_or(0)
    }

    pub(crate) fn disable_child_locks(&mut self, name: &ResourceName) {
        let index = self.ensure(name);
        self.nodes[index].child_locks_disabled = true;
    }

    pub(crate) fn set_capacity(&mut self, name: &ResourceName, capacity: usize) {
        let index = self.ensure(name);
        self.nodes[index].capacity = Some(capacity);
    }

    /// Declared capacity of `name`, inherited from the nearest ancestor
    /// that declares one.
    pub(crate) fn capacity(&self, name: &ResourceName) -> Option<usize> {
        let mut cursor = self.index.get(name).copied();
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            if node.capacity.is_some() {
                return node.capacity;
            }
            cursor = node.parent;
        }
        None
    }

    /// Panic if any node's counters disagree with a recount from the
    /// transaction index.
    pub(crate) fn assert_counts(&self, txn_locks: &HashMap<TxnId, Vec<Lock>>) {
        for node in &self.nodes {
            let mut expected: HashMap<TxnId, usize> = HashMap::new();
            for (txn, locks) in txn_locks {
                let count = locks
                    .iter()
                    .filter(|lock| lock.resource.is_descendant_of(&node.name))
                    .count();
                if count > 0 {
                    expected.insert(*txn, count);
                }
            }
            assert_eq!(
                expected, node.child_locks,
                "descendant counters out of sync at {}",
                node.name
            );
        }
    }
}

/// Handle to one node of the context tree. Cheap to clone; all state is
/// in the manager.
#[derive(Clone)]
pub struct LockContext {
    manager: Arc<LockManager>,
    name: ResourceName,
}

impl LockContext {
    pub(crate) fn new(manager: Arc<LockManager>, name: ResourceName) -> Self {
        Self { manager, name }
    }

    /// The resource this context stands for.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// The parent context, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<LockContext> {
        self.name
            .parent()
            .map(|name| LockContext::new(Arc::clone(&self.manager), name))
    }

    /// The context for child `segment`, created on first reference.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> LockContext {
        let name = self.name.child(segment);
        self.manager.state.lock().contexts.ensure(&name);
        LockContext::new(Arc::clone(&self.manager), name)
    }

    /// Acquire a `mode` lock here for the calling transaction, enforcing
    /// the intent protocol: the parent must hold a sufficient lock, and
    /// `S`/`IS` below an ancestor that already grants shared access is
    /// rejected as redundant. Blocks like
    /// [`LockManager::acquire`](crate::manager::LockManager::acquire).
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a read-only context;
    /// [`LockError::InvalidLock`] on a hierarchy violation or redundant
    /// shared lock; the manager's own `acquire` errors otherwise.
    pub fn acquire(&self, handle: &Arc<dyn TransactionHandle>, mode: LockMode) -> Result<()> {
        let should_block = {
            let mut table = self.manager.state.lock();
            table.contexts.ensure(&self.name);
            if table.contexts.is_readonly(&self.name) {
                return Err(LockError::unsupported(self.name.clone(), "context is read-only"));
            }
            if mode == LockMode::NL {
                return Err(LockError::invalid(
                    self.name.clone(),
                    "cannot acquire an NL lock; release instead",
                ));
            }
            if let Some(parent) = self.name.parent() {
                let parent_mode = table.mode_of(handle.id(), &parent);
                if !parent_mode.can_be_parent_of(mode) {
                    return Err(LockError::invalid(
                        self.name.clone(),
                        format!("{mode} under a parent holding {parent_mode}"),
                    ));
                }
            }
            if matches!(mode, LockMode::S | LockMode::IS) {
                if let Some(ancestor) = table.shared_ancestor(handle.id(), &self.name) {
                    return Err(LockError::invalid(
                        self.name.clone(),
                        format!("redundant {mode}: {ancestor} already grants shared access"),
                    ));
                }
            }
            table.acquire_locked(handle, &self.name, mode, self.manager.observer())?
        };
        if should_block {
            handle.block();
        }
        Ok(())
    }

    /// Release `txn`'s lock here. Descendant locks must go first.
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a read-only context;
    /// [`LockError::InvalidLock`] while `txn` still holds descendant
    /// locks; [`LockError::NoLockHeld`] if nothing is held here.
    pub fn release(&self, txn: TxnId) -> Result<()> {
        let mut woken = Woken::new();
        {
            let mut table = self.manager.state.lock();
            table.contexts.ensure(&self.name);
            if table.contexts.is_readonly(&self.name) {
                return Err(LockError::unsupported(self.name.clone(), "context is read-only"));
            }
            if table.contexts.child_lock_count(&self.name, txn) > 0 {
                return Err(LockError::invalid(
                    self.name.clone(),
                    "descendant locks must be released first",
                ));
            }
            table.release_locked(txn, &self.name, &mut woken)?;
        }
        for handle in woken {
            handle.unblock();
        }
        Ok(())
    }

    /// Promote the calling transaction's lock here to `new_mode`.
    ///
    /// Promotion to `SIX` is the special case: it is valid from `IS`,
    /// `IX`, or `S`, and atomically releases the transaction's descendant
    /// `S`/`IS` locks, which the new lock makes redundant. Every other
    /// target must substitute the held mode, and must remain legal under
    /// the parent's lock.
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a read-only context;
    /// [`LockError::NoLockHeld`] / [`LockError::DuplicateLockRequest`] /
    /// [`LockError::InvalidLock`] per the promotion contract above.
    pub fn promote(&self, handle: &Arc<dyn TransactionHandle>, new_mode: LockMode) -> Result<()> {
        let mut woken = Woken::new();
        let should_block = {
            let mut table = self.manager.state.lock();
            table.contexts.ensure(&self.name);
            if table.contexts.is_readonly(&self.name) {
                return Err(LockError::unsupported(self.name.clone(), "context is read-only"));
            }
            let txn = handle.id();
            let held = table.mode_of(txn, &self.name);
            if new_mode == LockMode::SIX {
                if held == LockMode::NL {
                    return Err(LockError::NoLockHeld {
                        txn,
                        resource: self.name.clone(),
                    });
                }
                if held == LockMode::SIX {
                    return Err(LockError::DuplicateLockRequest {
                        txn,
                        resource: self.name.clone(),
                    });
                }
                if held == LockMode::X {
                    return Err(LockError::invalid(
                        self.name.clone(),
                        "SIX is not a promotion of X",
                    ));
                }
                if let Some(ancestor) = table.shared_ancestor(txn, &self.name) {
                    return Err(LockError::invalid(
                        self.name.clone(),
                        format!("redundant SIX: {ancestor} already grants shared access"),
                    ));
                }
                if let Some(parent) = self.name.parent() {
                    let parent_mode = table.mode_of(txn, &parent);
                    if !parent_mode.can_be_parent_of(LockMode::SIX) {
                        return Err(LockError::invalid(
                            self.name.clone(),
                            format!("SIX under a parent holding {parent_mode}"),
                        ));
                    }
                }
                let mut release: Vec<ResourceName> = table
                    .descendant_locks(txn, &self.name)
                    .into_iter()
                    .filter(|(_, mode)| matches!(mode, LockMode::S | LockMode::IS))
                    .map(|(name, _)| name)
                    .collect();
                release.push(self.name.clone());
                table.acquire_and_release_locked(
                    handle,
                    &self.name,
                    LockMode::SIX,
                    &release,
                    self.manager.observer(),
                    &mut woken,
                )?
            } else {
                if held != LockMode::NL && held != new_mode {
                    if let Some(parent) = self.name.parent() {
                        let parent_mode = table.mode_of(txn, &parent);
                        if !parent_mode.can_be_parent_of(new_mode) {
                            return Err(LockError::invalid(
                                self.name.clone(),
                                format!("{new_mode} under a parent holding {parent_mode}"),
                            ));
                        }
                    }
                }
                table.promote_locked(handle, &self.name, new_mode, self.manager.observer())?
            }
        };
        for handle in woken {
            handle.unblock();
        }
        if should_block {
            handle.block();
        }
        Ok(())
    }

    /// Coarsen all of the calling transaction's locks in this subtree
    /// into a single lock here: `X` if anything in the subtree declares
    /// writes (`IX`/`SIX`/`X`), else `S`. Already-coarse contexts (`S` or
    /// `X` held, no descendant locks) are left alone, so the operation is
    /// idempotent.
    ///
    /// # Errors
    ///
    /// [`LockError::Unsupported`] on a read-only context;
    /// [`LockError::NoLockHeld`] if the transaction holds nothing here.
    pub fn escalate(&self, handle: &Arc<dyn TransactionHandle>) -> Result<()> {
        let mut woken = Woken::new();
        let should_block = {
            let mut table = self.manager.state.lock();
            table.contexts.ensure(&self.name);
            if table.contexts.is_readonly(&self.name) {
                return Err(LockError::unsupported(self.name.clone(), "context is read-only"));
            }
            let txn = handle.id();
            let held = table.mode_of(txn, &self.name);
            if held == LockMode::NL {
                return Err(LockError::NoLockHeld {
                    txn,
                    resource: self.name.clone(),
                });
            }
            let descendants = table.descendant_locks(txn, &self.name);
            if descendants.is_empty() && matches!(held, LockMode::S | LockMode::X) {
                return Ok(());
            }
            let writes_below = matches!(held, LockMode::IX | LockMode::SIX | LockMode::X)
                || descendants
                    .iter()
                    .any(|(_, mode)| matches!(mode, LockMode::IX | LockMode::SIX | LockMode::X));
            let target = if writes_below { LockMode::X } else { LockMode::S };
            let released = descendants.len();
            let mut release: Vec<ResourceName> =
                descendants.into_iter().map(|(name, _)| name).collect();
            release.push(self.name.clone());
            let block = table.acquire_and_release_locked(
                handle,
                &self.name,
                target,
                &release,
                self.manager.observer(),
                &mut woken,
            )?;
            observability::emit_escalated(self.manager.observer(), &self.name, txn, target, released);
            observability::record_escalation();
            block
        };
        for handle in woken {
            handle.unblock();
        }
        if should_block {
            handle.block();
        }
        Ok(())
    }

    /// The mode `txn` holds directly on this resource, or `NL`.
    #[must_use]
    pub fn explicit_lock_mode(&self, txn: TxnId) -> LockMode {
        self.manager.state.lock().mode_of(txn, &self.name)
    }

    /// The mode `txn` effectively has here once ancestors are taken into
    /// account: an ancestor `X` covers the subtree exclusively, an
    /// ancestor `S` or `SIX` covers it shared (shared coverage over an
    /// explicit `IX` amounts to `SIX`); intent modes cover nothing by
    /// themselves.
    #[must_use]
    pub fn effective_lock_mode(&self, txn: TxnId) -> LockMode {
        let table = self.manager.state.lock();
        let mut effective = table.mode_of(txn, &self.name);
        let mut cursor = self.name.parent();
        while let Some(ancestor) = cursor {
            let projected = match table.mode_of(txn, &ancestor) {
                LockMode::X => LockMode::X,
                LockMode::S | LockMode::SIX => LockMode::S,
                _ => LockMode::NL,
            };
            effective = match (projected, effective) {
                (LockMode::X, _) => LockMode::X,
                (LockMode::S, LockMode::IX) => LockMode::SIX,
                (LockMode::S, current) if !current.substitutes(LockMode::S) => LockMode::S,
                (_, current) => current,
            };
            cursor = ancestor.parent();
        }
        effective
    }

    /// Number of descendant contexts on which `txn` holds a lock.
    #[must_use]
    pub fn child_lock_count(&self, txn: TxnId) -> usize {
        self.manager
            .state
            .lock()
            .contexts
            .child_lock_count(&self.name, txn)
    }

    /// Declare how many lockable children live under this context.
    pub fn set_capacity(&self, capacity: usize) {
        self.manager
            .state
            .lock()
            .contexts
            .set_capacity(&self.name, capacity);
    }

    /// Declared capacity, inherited from the nearest ancestor that set one.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.manager.state.lock().contexts.capacity(&self.name)
    }

    /// Fraction of this context's capacity `txn` has locked below it.
    /// The host watches this to decide when to
    /// [`escalate`](Self::escalate). Zero when no capacity is declared.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn saturation(&self, txn: TxnId) -> f64 {
        let table = self.manager.state.lock();
        let count = table.contexts.child_lock_count(&self.name, txn);
        match table.contexts.capacity(&self.name) {
            Some(capacity) if capacity > 0 => count as f64 / capacity as f64,
            _ => 0.0,
        }
    }

    /// Forbid locking below this context: children created from now on
    /// are read-only. Used for structures whose pages must only ever be
    /// locked at the structure level.
    pub fn disable_child_locks(&self) {
        self.manager
            .state
            .lock()
            .contexts
            .disable_child_locks(&self.name);
    }

    /// Whether this context rejects mutating operations.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.manager.state.lock().contexts.is_readonly(&self.name)
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
