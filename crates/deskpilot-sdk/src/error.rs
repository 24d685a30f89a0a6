//! Error types for the SDK.
//!
//! Every remote operation, lifecycle call and connection action returns this
//! error type, whether it was invoked through the blocking or the async form.

use deskpilot_core::{LifecycleError, LifecycleEvent, LifecycleState, MachineId, MachineKind};
use thiserror::Error;

/// A result type using the SDK `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a machine.
#[derive(Debug, Error)]
pub enum Error {
    /// A blocking call was made from a thread already driving an async runtime.
    ///
    /// Blocking there would stall the runtime or deadlock against the
    /// background scheduler; await the operation instead.
    #[error(
        "blocking call made from inside an async runtime; await the operation instead of calling `.call()`"
    )]
    AsyncContext,

    /// The control plane answered with a non-success status.
    #[error("remote operation failed ({status}): {body}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Response body as returned by the server.
        body: String,
    },

    /// A lifecycle operation was attempted on a terminated machine.
    #[error("machine {} is terminated", .machine_id.as_ref().map_or("<unbound>", MachineId::as_str))]
    TerminatedMachine {
        /// The terminated machine, if it ever had an identity.
        machine_id: Option<MachineId>,
    },

    /// The operation needs a machine identity, but the machine was never created.
    #[error("machine has not been created yet")]
    NotCreated,

    /// The operation is not available for this kind of machine.
    #[error("{operation} is not supported on {kind} machines")]
    Unsupported {
        /// The rejected operation.
        operation: String,
        /// The kind of machine it was attempted on.
        kind: MachineKind,
    },

    /// The lifecycle event is not valid from the machine's current state.
    #[error("cannot {event} a machine that is {from}")]
    InvalidTransition {
        /// The current state.
        from: LifecycleState,
        /// The requested event.
        event: LifecycleEvent,
    },

    /// The request never produced a response (connect, timeout, TLS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response did not have the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The background scheduler stopped before delivering a result.
    #[error("background scheduler dropped the operation before it completed")]
    Detached,

    /// The background scheduler could not be started.
    #[error("background scheduler unavailable: {0}")]
    Runtime(String),

    /// A blocking caller stopped waiting; the operation may still complete in the background.
    #[error("gave up waiting after {0:?}")]
    TimedOut(std::time::Duration),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build the error for a lifecycle rejection on a given machine.
    #[must_use]
    pub fn from_lifecycle(err: LifecycleError, machine_id: Option<MachineId>) -> Self {
        match err {
            LifecycleError::Terminated(_) => Self::TerminatedMachine { machine_id },
            LifecycleError::InvalidTransition { from, event } => {
                Self::InvalidTransition { from, event }
            }
            LifecycleError::Unsupported { kind, event } => Self::Unsupported {
                operation: event.to_string(),
                kind,
            },
        }
    }

    /// Returns the HTTP status code if the control plane produced one.
    #[must_use]
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    ///
    /// The SDK never retries on its own; this is advice for callers.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<LifecycleError> for Error {
    fn from(err: LifecycleError) -> Self {
        Self::from_lifecycle(err, None)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
