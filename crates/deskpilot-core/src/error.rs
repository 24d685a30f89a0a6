//! Lifecycle error types.
//!
//! These errors are produced by the transition table and mapped into the
//! SDK's error taxonomy by callers that perform I/O.

use thiserror::Error;

use crate::lifecycle::{LifecycleEvent, LifecycleState, MachineKind};

/// A result type using `LifecycleError`.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors raised when a lifecycle event is not allowed in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The machine is terminated; no event can leave that state.
    #[error("machine is terminated and cannot accept {0}")]
    Terminated(LifecycleEvent),

    /// The event is not valid from the current state.
    #[error("invalid lifecycle transition: cannot {event} from {from}")]
    InvalidTransition {
        /// The current state.
        from: LifecycleState,
        /// The requested event.
        event: LifecycleEvent,
    },

    /// The event has no meaning for this kind of machine.
    #[error("{event} is not supported on {kind} machines")]
    Unsupported {
        /// The kind of machine.
        kind: MachineKind,
        /// The requested event.
        event: LifecycleEvent,
    },
}

impl LifecycleError {
    /// Returns the event that was rejected.
    #[must_use]
    pub const fn event(&self) -> LifecycleEvent {
        match self {
            Self::Terminated(event)
            | Self::InvalidTransition { event, .. }
            | Self::Unsupported { event, .. } => *event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        let err = LifecycleError::Terminated(LifecycleEvent::Start);
        assert_eq!(err.to_string(), "machine is terminated and cannot accept start");

        let err = LifecycleError::InvalidTransition {
            from: LifecycleState::Unbound,
            event: LifecycleEvent::Connect,
        };
        assert_eq!(
            err.to_string(),
            "invalid lifecycle transition: cannot connect from unbound"
        );
        assert_eq!(err.event(), LifecycleEvent::Connect);

        let err = LifecycleError::Unsupported {
            kind: MachineKind::Local,
            event: LifecycleEvent::Stop,
        };
        assert_eq!(err.to_string(), "stop is not supported on local machines");
    }
}
