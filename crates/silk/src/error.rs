//! Runtime error type

use crate::reactor::Event;
use thiserror::Error;

/// Errors surfaced by fallible reactor operations.
///
/// Invariant violations (resuming an executing fiber, re-entering a finished
/// trampoline) are not represented here: those are programming-contract
/// breaches and terminate via `fatal!`. The one exception is duplicate event
/// registration, which the reactor reports as an error so callers can log
/// and recover.
#[derive(Debug, Error)]
pub enum Error {
    /// The interest is already registered for this descriptor; it must be
    /// removed or cancelled before it can be registered again.
    #[error("event {event:?} already registered for fd {fd}")]
    EventExists {
        /// Descriptor the registration targeted
        fd: i32,
        /// Interest that was already present
        event: Event,
    },

    /// The calling thread has no scheduler installed, so there is nowhere
    /// to resume the waiter.
    #[error("no scheduler on the current thread")]
    NoScheduler,

    /// The underlying OS call failed.
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
}
