//! Client SDK for driving desktop machines.
//!
//! A [`Client`] hands out [`Machine`] handles. A machine is either remote,
//! provisioned through the control plane, or local, served by a backend on
//! the caller's host. Connecting to a running machine yields a
//! [`Connection`] that sends keyboard and mouse input, reads the pointer and
//! captures the screen. Remote connections can also hand control to a human
//! operator and wait for it to come back.
//!
//! Every operation returns an [`Operation`], usable both as a future and as
//! a blocking call:
//!
//! ```no_run
//! use deskpilot_sdk::{Client, Result};
//!
//! fn main() -> Result<()> {
//!     let client = Client::new()?;
//!     let machine = client.machines().temporary();
//!     machine.session_blocking(|conn| {
//!         conn.left_click(Some((100, 100))).call()?;
//!         conn.type_text("hello").call()?;
//!         let shot = conn.screenshot().call()?;
//!         println!("{} bytes", shot.len());
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ```no_run
//! use deskpilot_sdk::{Client, Result};
//!
//! # async fn run() -> Result<()> {
//! let client = Client::new()?;
//! let machine = client.machines().create().await?;
//! let conn = machine.connect().await?;
//! conn.key("ctrl+l").await?;
//! let (x, y) = conn.cursor_position().await?;
//! machine.stop().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handoff;
pub mod logging;
pub mod machine;
pub mod shim;
pub mod transport;

pub use action::{Action, ActionOutput};
pub use client::Client;
pub use config::{BackoffPolicy, ClientConfig, InputTiming};
pub use connection::{Connection, MouseButton, Screenshot, DISPLAY_HEIGHT, DISPLAY_WIDTH};
pub use error::{Error, Result};
pub use handoff::Backoff;
pub use machine::{Machine, MachineStatus, Machines};
pub use shim::{background_running, in_async_context, shutdown_background, BackgroundGuard, Operation};
pub use transport::{ApiRequest, HttpTransport, Method, RecordedCall, RecordingTransport, Reply, Transport};

pub use deskpilot_core::{ConnectionId, LifecycleEvent, LifecycleState, MachineId, MachineKind};
