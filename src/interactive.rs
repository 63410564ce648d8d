//! The interactive-thread contract.
//!
//! Exactly one thread drives the user-facing side (registry edits, unlock,
//! dialogs). It calls [`enter`] once and keeps the returned guard alive.
//! Operations that may block on I/O call [`forbid`] first; on the marked
//! thread that fails with [`LongOperationError`].

use std::cell::Cell;
use std::marker::PhantomData;

use tracing::error;

thread_local! {
    static INTERACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// A blocking operation was invoked on the interactive thread.
///
/// This is a wiring bug, not a runtime condition to retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("blocking operation `{operation}` invoked on the interactive thread")]
pub struct LongOperationError {
    /// Name of the rejected operation.
    pub operation: &'static str,
}

/// Marks the current thread as interactive until dropped.
///
/// Not `Send`: the mark belongs to the thread that created it.
#[derive(Debug)]
pub struct InteractiveGuard {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

impl Drop for InteractiveGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        INTERACTIVE.with(|flag| flag.set(previous));
    }
}

/// Mark the calling thread as the interactive thread.
#[must_use = "the thread is only marked while the guard is alive"]
pub fn enter() -> InteractiveGuard {
    let previous = INTERACTIVE.with(|flag| flag.replace(true));
    InteractiveGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Whether the calling thread is currently marked interactive.
pub fn is_interactive() -> bool {
    INTERACTIVE.with(Cell::get)
}

/// Reject `operation` if called on the interactive thread.
///
/// # Errors
///
/// Returns [`LongOperationError`] when the calling thread is marked.
pub fn forbid(operation: &'static str) -> Result<(), LongOperationError> {
    if is_interactive() {
        error!(operation, "blocking operation invoked on interactive thread");
        return Err(LongOperationError { operation });
    }
    Ok(())
}
