//! Declarative lock acquisition.
//!
//! [`ensure_sufficient_lock_held`] is the entry point user code should
//! reach for: given a context and the capability it needs there (`S`, `X`,
//! or nothing), it plans and performs the minimal sequence of intent-lock
//! acquisitions, promotions, and escalations (on the ancestors first,
//! then locally) that makes the capability hold. Calling it again with
//! the same arguments does nothing.

use std::sync::Arc;

use granlock_error::{LockError, Result};
use granlock_types::LockMode;

use crate::context::LockContext;
use crate::txn::TransactionHandle;

/// Make sure the calling transaction can perform actions requiring
/// `request` on `context`, taking the least permissive locks that
/// suffice.
///
/// `request` must be `S`, `X`, or `NL` (`NL` asks for nothing and returns
/// immediately). The local action is chosen by what is already held: an
/// `IX` asked to also cover reads becomes `SIX`; any other intent lock is
/// escalated so the subtree collapses into the real lock here (then
/// promoted if the escalation yielded `S` and `X` was wanted); `NL`
/// acquires; a plain `S` asked for `X` is promoted.
///
/// # Errors
///
/// [`LockError::InvalidLock`] if `request` is an intent mode; otherwise
/// whatever the underlying context operations surface.
pub fn ensure_sufficient_lock_held(
    handle: &Arc<dyn TransactionHandle>,
    context: &LockContext,
    request: LockMode,
) -> Result<()> {
    if request == LockMode::NL {
        return Ok(());
    }
    if request.is_intent() {
        return Err(LockError::invalid(
            context.name().clone(),
            "only S, X, or NL may be requested through the facade",
        ));
    }

    let txn = handle.id();
    let effective = context.effective_lock_mode(txn);
    let explicit = context.explicit_lock_mode(txn);
    if effective.substitutes(request) || explicit.substitutes(request) {
        return Ok(());
    }

    if let Some(parent) = context.parent() {
        ensure_ancestors(handle, &parent, request.parent_mode())?;
    }

    match explicit {
        LockMode::IX if request == LockMode::S => context.promote(handle, LockMode::SIX),
        mode if mode.is_intent() => {
            // Collapse the subtree into a real lock here. Escalation picks
            // S when nothing below declares writes, so an X request may
            // still need one promotion on top.
            context.escalate(handle)?;
            if context.explicit_lock_mode(txn).substitutes(request) {
                Ok(())
            } else {
                context.promote(handle, request)
            }
        }
        LockMode::NL => context.acquire(handle, request),
        _ => context.promote(handle, request),
    }
}

/// Walk up from `context`, making each ancestor hold at least `needed`
/// (`IS` beneath a shared request, `IX` beneath an exclusive one),
/// grandparents before parents so the hierarchy stays legal at every
/// step.
fn ensure_ancestors(
    handle: &Arc<dyn TransactionHandle>,
    context: &LockContext,
    needed: LockMode,
) -> Result<()> {
    let txn = handle.id();
    let explicit = context.explicit_lock_mode(txn);
    // SIX is not substitutable for IX (it does not admit shared children)
    // but as an ancestor it discharges both parent duties, so it never
    // needs touching here.
    if explicit == LockMode::SIX
        || explicit.substitutes(needed)
        || context.effective_lock_mode(txn).substitutes(needed)
    {
        return Ok(());
    }
    if let Some(parent) = context.parent() {
        ensure_ancestors(handle, &parent, needed.parent_mode())?;
    }
    match (explicit, needed) {
        (LockMode::NL, _) => context.acquire(handle, needed),
        // A shared holder that now also needs write intent below keeps
        // its read coverage by moving to SIX.
        (LockMode::S, LockMode::IX) => context.promote(handle, LockMode::SIX),
        _ => context.promote(handle, needed),
    }
}
