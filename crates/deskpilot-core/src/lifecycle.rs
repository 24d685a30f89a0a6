//! Machine lifecycle state machine.
//!
//! Every lifecycle call on a machine is validated here before any I/O
//! happens. The table is keyed by `(kind, state, event)` and yields either a
//! [`Transition`] describing what the caller must do, or a
//! [`LifecycleError`].
//!
//! # State Machine
//!
//! ```text
//!     ┌─────────┐  create   ┌─────────┐  (implied start)  ┌─────────┐
//!     │ Unbound │──────────▶│ Created │──────────────────▶│ Running │◄──┐
//!     └────┬────┘           └────┬────┘                   └────┬────┘   │
//!          │                     │                      stop │        │ start
//!          │                     │                           ▼        │
//!          │                     │                      ┌─────────┐   │
//!          │                     │                      │ Stopped │───┘
//!          │                     │                      └────┬────┘
//!          │ terminate           │ terminate                 │ terminate
//!          ▼                     ▼                           ▼
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                         Terminated                           │
//!     └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Terminated` is absorbing. A local machine has no remote identity and sits
//! permanently in `Running` until it is terminated locally.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};

/// Where a machine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineKind {
    /// A machine driven through a local backend on this host.
    Local,
    /// A machine managed by the remote control plane.
    Remote,
}

impl fmt::Display for MachineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Lifecycle state of a machine as last known by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not yet created; the machine has no identity.
    Unbound,
    /// Created on the control plane but not known to be running.
    Created,
    /// Running and accepting connections.
    Running,
    /// Stopped; may be started again.
    Stopped,
    /// Terminated; remote resources released.
    Terminated,
}

impl LifecycleState {
    /// Map a status string reported by the control plane onto a state.
    ///
    /// Unknown or transitional statuses map to `Created`, which forces a
    /// start request before the machine can be connected to.
    #[must_use]
    pub fn from_remote_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" | "started" => Self::Running,
            "stopped" | "stopping" => Self::Stopped,
            "terminated" | "terminating" | "deleted" => Self::Terminated,
            _ => Self::Created,
        }
    }

    /// Returns true if the state carries a server-issued identity.
    #[must_use]
    pub const fn has_identity(self) -> bool {
        !matches!(self, Self::Unbound)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "unbound",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A lifecycle operation requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Create the machine (implies start).
    Create,
    /// Start the machine.
    Start,
    /// Stop the machine.
    Stop,
    /// Terminate the machine and release its resources.
    Terminate,
    /// Open a connection to the machine.
    Connect,
}

impl LifecycleEvent {
    /// All events, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Create,
        Self::Start,
        Self::Stop,
        Self::Terminate,
        Self::Connect,
    ];
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Terminate => "terminate",
            Self::Connect => "connect",
        };
        f.write_str(s)
    }
}

/// What the caller must do to apply an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Issue the control-plane request; commit `settles_in` only on success.
    Remote {
        /// The state to commit once the remote call succeeds.
        settles_in: LifecycleState,
    },
    /// Commit `settles_in` without any remote call.
    Local {
        /// The state to commit.
        settles_in: LifecycleState,
    },
    /// Nothing to do; the state does not change and no lifecycle call is made.
    Unchanged,
}

impl Transition {
    /// Returns the state committed by this transition, if it changes state.
    #[must_use]
    pub const fn target(self) -> Option<LifecycleState> {
        match self {
            Self::Remote { settles_in } | Self::Local { settles_in } => Some(settles_in),
            Self::Unchanged => None,
        }
    }
}

/// Look up `(kind, state, event)` in the transition table.
///
/// # Errors
///
/// Returns `LifecycleError::Terminated` for any event on a terminated machine,
/// `LifecycleError::Unsupported` for events a local machine has no notion of,
/// and `LifecycleError::InvalidTransition` for everything else not in the table.
pub const fn transition(
    kind: MachineKind,
    state: LifecycleState,
    event: LifecycleEvent,
) -> Result<Transition> {
    use LifecycleEvent::{Connect, Create, Start, Stop, Terminate};
    use LifecycleState::{Created, Running, Stopped, Terminated, Unbound};

    if matches!(state, Terminated) {
        return Err(LifecycleError::Terminated(event));
    }

    match kind {
        MachineKind::Local => match event {
            Start | Connect => Ok(Transition::Unchanged),
            Terminate => Ok(Transition::Local {
                settles_in: Terminated,
            }),
            Create | Stop => Err(LifecycleError::Unsupported { kind, event }),
        },
        MachineKind::Remote => match (state, event) {
            // Creation implies start
            (Unbound, Create) => Ok(Transition::Remote {
                settles_in: Running,
            }),
            // Nothing was ever allocated
            (Unbound, Terminate) => Ok(Transition::Local {
                settles_in: Terminated,
            }),
            (Created | Stopped, Start) => Ok(Transition::Remote {
                settles_in: Running,
            }),
            (Running, Start | Connect) => Ok(Transition::Unchanged),
            (Running, Stop) => Ok(Transition::Remote {
                settles_in: Stopped,
            }),
            (Created | Running | Stopped, Terminate) => Ok(Transition::Remote {
                settles_in: Terminated,
            }),
            (from, event) => Err(LifecycleError::InvalidTransition { from, event }),
        },
    }
}

/// Returns the events accepted from the given state.
#[must_use]
pub fn valid_events_from(kind: MachineKind, state: LifecycleState) -> Vec<LifecycleEvent> {
    LifecycleEvent::ALL
        .into_iter()
        .filter(|event| transition(kind, state, *event).is_ok())
        .collect()
}

/// Returns true if no event can leave the state.
#[must_use]
pub const fn is_terminal(state: LifecycleState) -> bool {
    matches!(state, LifecycleState::Terminated)
}

/// Returns true if a connection may be opened in the state.
#[must_use]
pub const fn can_connect(state: LifecycleState) -> bool {
    matches!(state, LifecycleState::Running)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [LifecycleState; 5] = [
        LifecycleState::Unbound,
        LifecycleState::Created,
        LifecycleState::Running,
        LifecycleState::Stopped,
        LifecycleState::Terminated,
    ];

    #[test]
    fn remote_happy_path() {
        use LifecycleEvent::*;
        use LifecycleState::*;
        let remote = MachineKind::Remote;

        assert_eq!(
            transition(remote, Unbound, Create),
            Ok(Transition::Remote { settles_in: Running })
        );
        assert_eq!(
            transition(remote, Running, Stop),
            Ok(Transition::Remote { settles_in: Stopped })
        );
        assert_eq!(
            transition(remote, Stopped, Start),
            Ok(Transition::Remote { settles_in: Running })
        );
        assert_eq!(
            transition(remote, Created, Start),
            Ok(Transition::Remote { settles_in: Running })
        );
        assert_eq!(
            transition(remote, Running, Terminate),
            Ok(Transition::Remote {
                settles_in: Terminated
            })
        );
    }

    #[test]
    fn start_on_running_is_fast_path() {
        let t = transition(
            MachineKind::Remote,
            LifecycleState::Running,
            LifecycleEvent::Start,
        );
        assert_eq!(t, Ok(Transition::Unchanged));
        assert_eq!(t.unwrap().target(), None);
    }

    #[test]
    fn terminated_is_absorbing() {
        for kind in [MachineKind::Local, MachineKind::Remote] {
            for event in LifecycleEvent::ALL {
                assert_eq!(
                    transition(kind, LifecycleState::Terminated, event),
                    Err(LifecycleError::Terminated(event)),
                    "{kind} {event}"
                );
            }
            assert!(valid_events_from(kind, LifecycleState::Terminated).is_empty());
        }
    }

    #[test]
    fn terminate_reaches_terminated_from_every_live_state() {
        for state in STATES.into_iter().filter(|s| !is_terminal(*s)) {
            let t = transition(MachineKind::Remote, state, LifecycleEvent::Terminate).unwrap();
            assert_eq!(t.target(), Some(LifecycleState::Terminated), "{state}");
        }
    }

    #[test]
    fn terminate_unbound_makes_no_remote_call() {
        assert_eq!(
            transition(
                MachineKind::Remote,
                LifecycleState::Unbound,
                LifecycleEvent::Terminate
            ),
            Ok(Transition::Local {
                settles_in: LifecycleState::Terminated
            })
        );
    }

    #[test]
    fn connect_only_from_running() {
        for state in STATES {
            let ok = transition(MachineKind::Remote, state, LifecycleEvent::Connect).is_ok();
            assert_eq!(ok, can_connect(state), "{state}");
        }
    }

    #[test]
    fn create_only_from_unbound() {
        for state in STATES {
            let ok = transition(MachineKind::Remote, state, LifecycleEvent::Create).is_ok();
            assert_eq!(ok, state == LifecycleState::Unbound, "{state}");
        }
    }

    #[test]
    fn invalid_remote_transitions() {
        use LifecycleEvent::*;
        use LifecycleState::*;
        let remote = MachineKind::Remote;

        assert_eq!(
            transition(remote, Unbound, Start),
            Err(LifecycleError::InvalidTransition {
                from: Unbound,
                event: Start
            })
        );
        assert!(transition(remote, Stopped, Stop).is_err());
        assert!(transition(remote, Created, Stop).is_err());
        assert!(transition(remote, Stopped, Connect).is_err());
    }

    #[test]
    fn local_machine_rules() {
        use LifecycleEvent::*;
        let local = MachineKind::Local;
        let running = LifecycleState::Running;

        assert_eq!(transition(local, running, Start), Ok(Transition::Unchanged));
        assert_eq!(transition(local, running, Connect), Ok(Transition::Unchanged));
        assert_eq!(
            transition(local, running, Terminate),
            Ok(Transition::Local {
                settles_in: LifecycleState::Terminated
            })
        );
        assert_eq!(
            transition(local, running, Stop),
            Err(LifecycleError::Unsupported { kind: local, event: Stop })
        );
        assert!(matches!(
            transition(local, running, Create),
            Err(LifecycleError::Unsupported { .. })
        ));
    }

    #[test]
    fn valid_events_from_running() {
        let events = valid_events_from(MachineKind::Remote, LifecycleState::Running);
        assert_eq!(
            events,
            vec![
                LifecycleEvent::Start,
                LifecycleEvent::Stop,
                LifecycleEvent::Terminate,
                LifecycleEvent::Connect
            ]
        );
    }

    #[test]
    fn remote_status_mapping() {
        use LifecycleState::*;
        assert_eq!(LifecycleState::from_remote_status("Running"), Running);
        assert_eq!(LifecycleState::from_remote_status("stopped"), Stopped);
        assert_eq!(LifecycleState::from_remote_status("TERMINATED"), Terminated);
        assert_eq!(LifecycleState::from_remote_status("provisioning"), Created);
    }

    #[test]
    fn identity_tracks_state() {
        assert!(!LifecycleState::Unbound.has_identity());
        for state in &STATES[1..] {
            assert!(state.has_identity());
        }
    }

    #[test]
    fn serde_names() {
        let json = serde_json::to_string(&LifecycleState::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let kind: MachineKind = serde_json::from_str("\"remote\"").unwrap();
        assert_eq!(kind, MachineKind::Remote);
    }
}
