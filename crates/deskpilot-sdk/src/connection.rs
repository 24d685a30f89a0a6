//! Input and screen access for a connected machine.
//!
//! A [`Connection`] exposes a fixed vocabulary of actions. Each one is a
//! dual-mode [`Operation`] routed to the remote control plane or the local
//! backend depending on the machine kind; both routes have the same
//! semantics.
//!
//! Composite clicks and drags pause between steps. The remote input device
//! drops events that arrive back to back, so the delays in
//! [`InputTiming`](crate::config::InputTiming) are part of the protocol.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use base64::prelude::*;
use deskpilot_core::{ConnectionId, LifecycleState, MachineId, MachineKind};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::handoff;
use crate::machine::{MachineShared, MachineStatus};
use crate::shim::Operation;
use crate::Client;

/// Display width in pixels.
pub const DISPLAY_WIDTH: u32 = 1024;
/// Display height in pixels.
pub const DISPLAY_HEIGHT: u32 = 768;

/// A mouse button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    /// Primary button.
    Left,
    /// Secondary button.
    Right,
    /// Wheel button.
    Middle,
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Middle => "middle",
        };
        f.write_str(s)
    }
}

/// Raw screenshot bytes as returned by the machine, in whatever image
/// format the backend produced.
#[derive(Clone, PartialEq, Eq)]
pub struct Screenshot(Vec<u8>);

impl Screenshot {
    /// The raw image bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the screenshot, returning the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the backend returned no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Standard base64 encoding of the raw bytes.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.0)
    }
}

impl fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Screenshot({} bytes)", self.0.len())
    }
}

#[derive(Debug, Deserialize)]
struct CursorPosition {
    x: i32,
    y: i32,
}

#[derive(Debug)]
struct ConnectionInner {
    client: Client,
    machine: Weak<MachineShared>,
    kind: MachineKind,
    machine_id: Option<MachineId>,
    id: Option<ConnectionId>,
}

/// A connection to a running machine.
///
/// Holds only identifiers and a non-owning reference back to its machine;
/// cloning is cheap. Once the machine is terminated, or its last [`Machine`]
/// handle is dropped, every action fails with [`Error::TerminatedMachine`].
///
/// [`Machine`]: crate::Machine
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        machine: &Arc<MachineShared>,
        machine_id: Option<MachineId>,
        id: Option<ConnectionId>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                client: machine.client().clone(),
                machine: Arc::downgrade(machine),
                kind: machine.kind(),
                machine_id,
                id,
            }),
        }
    }

    /// The server-issued connection ID; `None` for local machines.
    #[must_use]
    pub fn id(&self) -> Option<&ConnectionId> {
        self.inner.id.as_ref()
    }

    /// The machine this connection belongs to; `None` for local machines.
    #[must_use]
    pub fn machine_id(&self) -> Option<&MachineId> {
        self.inner.machine_id.as_ref()
    }

    /// Whether the machine is local or remote.
    #[must_use]
    pub fn kind(&self) -> MachineKind {
        self.inner.kind
    }

    /// Display width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        DISPLAY_WIDTH
    }

    /// Display height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        DISPLAY_HEIGHT
    }

    /// Link to watch this connection's desktop in the browser.
    #[must_use]
    pub fn viewer_url(&self) -> Option<String> {
        let machine_id = self.inner.machine_id.as_ref()?;
        let url = self.inner.client.ui_url(&format!("app/vms/{machine_id}"));
        Some(match &self.inner.id {
            Some(id) => format!("{url}?connectionId={id}"),
            None => url,
        })
    }

    /// State of the owning machine, or `None` once its handle is gone.
    fn machine_state(&self) -> Option<LifecycleState> {
        self.inner.machine.upgrade().map(|m| m.state())
    }

    fn ensure_live(&self) -> Result<()> {
        match self.machine_state() {
            Some(state) if state != LifecycleState::Terminated => Ok(()),
            _ => Err(Error::TerminatedMachine {
                machine_id: self.inner.machine_id.clone(),
            }),
        }
    }

    fn require_remote(&self, operation: &str) -> Result<&MachineId> {
        match (self.inner.kind, &self.inner.machine_id) {
            (MachineKind::Remote, Some(id)) => Ok(id),
            (MachineKind::Remote, None) => Err(Error::NotCreated),
            (kind, _) => Err(Error::Unsupported {
                operation: operation.to_string(),
                kind,
            }),
        }
    }

    /// URL of an input/query endpoint for this connection.
    fn endpoint(&self, remote: &str, local: &str) -> String {
        match (self.inner.kind, &self.inner.machine_id) {
            (MachineKind::Remote, Some(machine_id)) => {
                let path = match &self.inner.id {
                    Some(id) => format!("vms/{machine_id}/{remote}?connection_id={id}"),
                    None => format!("vms/{machine_id}/{remote}"),
                };
                self.inner.client.remote_url(&path)
            }
            _ => self.inner.client.local_url(local),
        }
    }

    fn op<T, F, Fut>(&self, name: &'static str, f: F) -> Operation<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let this = self.clone();
        Operation::new(name, async move {
            this.ensure_live()?;
            f(this).await
        })
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    pub(crate) async fn send_key(&self, combo: &str) -> Result<()> {
        let url = self.endpoint("key", "computer/input/keyboard/key");
        self.inner.client.api().post_discard(url, json!({ "text": combo })).await
    }

    pub(crate) async fn send_text(&self, text: &str) -> Result<()> {
        let url = self.endpoint("type", "computer/input/keyboard/type");
        self.inner.client.api().post_discard(url, json!({ "text": text })).await
    }

    pub(crate) async fn move_to(&self, x: i32, y: i32) -> Result<()> {
        let url = self.endpoint("mouse_move", "computer/input/mouse/move");
        self.inner.client.api().post_discard(url, json!({ "x": x, "y": y })).await
    }

    /// Coordinates are forwarded independently; the backend fills in a
    /// missing one from the current pointer position.
    pub(crate) async fn click_at(&self, button: MouseButton, down: bool, x: Option<i32>, y: Option<i32>) -> Result<()> {
        let url = self.endpoint("mouse_click", "computer/input/mouse/click");
        let body = json!({
            "button": button,
            "down": down,
            "x": x,
            "y": y,
        });
        self.inner.client.api().post_discard(url, body).await
    }

    async fn click(&self, button: MouseButton, down: bool, at: Option<(i32, i32)>) -> Result<()> {
        self.click_at(button, down, at.map(|(x, _)| x), at.map(|(_, y)| y)).await
    }

    pub(crate) async fn fetch_cursor(&self) -> Result<(i32, i32)> {
        let url = self.endpoint("cursor_position", "computer/input/mouse/position");
        let position: CursorPosition = self.inner.client.api().get_json(url).await?;
        Ok((position.x, position.y))
    }

    pub(crate) async fn capture(&self) -> Result<Screenshot> {
        let url = self.endpoint("screenshot", "computer/display/screenshot");
        self.inner.client.api().get_bytes(url).await.map(Screenshot)
    }

    // =========================================================================
    // Composites
    // =========================================================================

    /// Optional move, then press and release `button`.
    pub(crate) async fn single_click(&self, button: MouseButton, at: Option<(i32, i32)>) -> Result<()> {
        let timing = self.inner.client.config().input_timing;
        if let Some((x, y)) = at {
            self.move_to(x, y).await?;
        }
        self.click(button, true, at).await?;
        tokio::time::sleep(timing.press_release()).await;
        self.click(button, false, at).await
    }

    pub(crate) async fn double(&self, at: Option<(i32, i32)>) -> Result<()> {
        let timing = self.inner.client.config().input_timing;
        if let Some((x, y)) = at {
            self.move_to(x, y).await?;
        }
        self.click(MouseButton::Left, true, at).await?;
        tokio::time::sleep(timing.press_release()).await;
        self.click(MouseButton::Left, false, at).await?;
        tokio::time::sleep(timing.double_click_gap()).await;
        self.click(MouseButton::Left, true, at).await?;
        tokio::time::sleep(timing.press_release()).await;
        self.click(MouseButton::Left, false, at).await
    }

    pub(crate) async fn drag(&self, x: i32, y: i32) -> Result<()> {
        let timing = self.inner.client.config().input_timing;
        self.click(MouseButton::Left, true, None).await?;
        tokio::time::sleep(timing.drag_step()).await;
        self.move_to(x, y).await?;
        tokio::time::sleep(timing.drag_step()).await;
        self.click(MouseButton::Left, false, Some((x, y))).await
    }

    pub(crate) async fn pause_bots(&self) -> Result<()> {
        let machine_id = self.require_remote("yield_control")?;
        let url = self
            .inner
            .client
            .remote_url(&format!("vms/{machine_id}/pause_bots/true"));
        self.inner.client.api().put(url).await?;
        tracing::info!(
            "Control has been yielded. Open this URL to resolve and hand control back to automation:"
        );
        tracing::info!("-> {}", self.viewer_url().unwrap_or_default());
        Ok(())
    }

    async fn wait_for_control(&self) -> Result<()> {
        let machine_id = self.require_remote("await_control")?;
        let url = self.inner.client.remote_url(&format!("vms/{machine_id}"));
        let api = self.inner.client.api();
        let policy = self.inner.client.config().backoff;
        handoff::wait_until_resumed(policy, || {
            let url = url.clone();
            async move {
                let status: MachineStatus = api.get_json(url).await?;
                Ok::<_, Error>(status.pause_bots)
            }
        })
        .await
    }

    // =========================================================================
    // Public actions
    // =========================================================================

    /// Send a key combination, e.g. `"a"`, `"Return"`, `"alt+Tab"` or
    /// `"ctrl+c ctrl+v"`.
    pub fn key(&self, combo: impl Into<String>) -> Operation<()> {
        let combo = combo.into();
        self.op("key", move |c| async move { c.send_key(&combo).await })
    }

    /// Type text.
    pub fn type_text(&self, text: impl Into<String>) -> Operation<()> {
        let text = text.into();
        self.op("type", move |c| async move { c.send_text(&text).await })
    }

    /// Move the pointer to `(x, y)`.
    pub fn mouse_move(&self, x: i32, y: i32) -> Operation<()> {
        self.op("mouse_move", move |c| async move { c.move_to(x, y).await })
    }

    /// Press (`down = true`) or release a mouse button. `x` and `y` are
    /// sent as given; either may be omitted.
    pub fn mouse_click(&self, button: MouseButton, down: bool, x: Option<i32>, y: Option<i32>) -> Operation<()> {
        self.op("mouse_click", move |c| async move { c.click_at(button, down, x, y).await })
    }

    /// Current pointer position.
    pub fn cursor_position(&self) -> Operation<(i32, i32)> {
        self.op("cursor_position", |c| async move { c.fetch_cursor().await })
    }

    /// Capture the screen as raw image bytes.
    pub fn screenshot(&self) -> Operation<Screenshot> {
        self.op("screenshot", |c| async move { c.capture().await })
    }

    /// Left click, moving to `at` first if given.
    pub fn left_click(&self, at: Option<(i32, i32)>) -> Operation<()> {
        self.op("left_click", move |c| async move {
            c.single_click(MouseButton::Left, at).await
        })
    }

    /// Right click, moving to `at` first if given.
    pub fn right_click(&self, at: Option<(i32, i32)>) -> Operation<()> {
        self.op("right_click", move |c| async move {
            c.single_click(MouseButton::Right, at).await
        })
    }

    /// Double left click, moving to `at` first if given.
    pub fn double_click(&self, at: Option<(i32, i32)>) -> Operation<()> {
        self.op("double_click", move |c| async move { c.double(at).await })
    }

    /// Press the left button at the current position and drag to `(x, y)`.
    pub fn left_click_drag(&self, x: i32, y: i32) -> Operation<()> {
        self.op("left_click_drag", move |c| async move { c.drag(x, y).await })
    }

    /// Hand control of a remote machine to a human operator.
    ///
    /// Returns once the control plane acknowledges the pause; it does not
    /// wait for the human. Fails with [`Error::Unsupported`] on local machines.
    pub fn yield_control(&self) -> Operation<()> {
        self.op("yield_control", |c| async move { c.pause_bots().await })
    }

    /// Wait until a human operator hands control back.
    ///
    /// Polls with capped exponential backoff and has no deadline of its own;
    /// wrap the awaited future in a timeout to bound it. Fails with
    /// [`Error::Unsupported`] on local machines.
    pub fn await_control(&self) -> Operation<()> {
        self.op("await_control", |c| async move { c.wait_for_control().await })
    }

    /// Delete the connection on the control plane.
    ///
    /// A no-op for local machines and once the machine is terminated. A
    /// dropped machine handle does not stop the delete: the server-side
    /// connection outlives the handle.
    pub fn close(&self) -> Operation<()> {
        let this = self.clone();
        Operation::new("close", async move {
            let (Some(machine_id), Some(id)) = (&this.inner.machine_id, &this.inner.id) else {
                return Ok(());
            };
            if this.machine_state() == Some(LifecycleState::Terminated) {
                return Ok(());
            }
            let url = this
                .inner
                .client
                .remote_url(&format!("vms/{machine_id}/connections/{id}"));
            this.inner.client.api().delete(url).await
        })
    }
}
