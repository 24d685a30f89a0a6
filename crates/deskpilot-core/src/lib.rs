//! Core types for deskpilot.
//!
//! This crate provides the I/O-free foundation shared by the SDK:
//!
//! - **Identifiers**: Strongly-typed, server-issued IDs for machines and connections
//! - **Lifecycle**: The machine state machine and its central transition table
//! - **Error types**: Lifecycle violations
//!
//! # Example
//!
//! ```
//! use deskpilot_core::{transition, LifecycleEvent, LifecycleState, MachineKind, Transition};
//!
//! // Starting a running machine needs no remote call.
//! let t = transition(MachineKind::Remote, LifecycleState::Running, LifecycleEvent::Start).unwrap();
//! assert_eq!(t, Transition::Unchanged);
//!
//! // Starting a stopped machine does.
//! let t = transition(MachineKind::Remote, LifecycleState::Stopped, LifecycleEvent::Start).unwrap();
//! assert_eq!(t, Transition::Remote { settles_in: LifecycleState::Running });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod lifecycle;

pub use error::{LifecycleError, Result};
pub use ids::{ConnectionId, IdError, MachineId};
pub use lifecycle::{transition, LifecycleEvent, LifecycleState, MachineKind, Transition};
