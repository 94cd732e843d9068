//! Thread-local runtime state: the current context and the last observed
//! status.
//!
//! Both slots are keyed by the runtime instance id so that independent
//! runtimes in one process (common in tests) never see each other's state.

use std::cell::RefCell;

use crate::error::FreshetError;
use crate::types::ContextId;

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<(u64, ContextId)>> = const { RefCell::new(None) };
    static LAST_STATUS: RefCell<Option<(u64, Option<FreshetError>)>> = const { RefCell::new(None) };
}

/// Bind `ctx` as the calling thread's current context, or clear the slot.
pub(crate) fn set_current(runtime: u64, ctx: Option<ContextId>) {
    CURRENT_CONTEXT.with(|slot| {
        *slot.borrow_mut() = ctx.map(|c| (runtime, c));
    });
}

/// The calling thread's current context under `runtime`, if any.
pub(crate) fn current(runtime: u64) -> Option<ContextId> {
    CURRENT_CONTEXT.with(|slot| match *slot.borrow() {
        Some((owner, ctx)) if owner == runtime => Some(ctx),
        _ => None,
    })
}

/// Record the status of the most recent public operation on this thread.
pub(crate) fn record_status(runtime: u64, status: Option<&FreshetError>) {
    LAST_STATUS.with(|slot| {
        *slot.borrow_mut() = Some((runtime, status.cloned()));
    });
}

/// The error of the most recent public operation on this thread, or `None`
/// when it succeeded (or nothing ran yet).
pub(crate) fn last_status(runtime: u64) -> Option<FreshetError> {
    LAST_STATUS.with(|slot| match &*slot.borrow() {
        Some((owner, status)) if *owner == runtime => status.clone(),
        _ => None,
    })
}
