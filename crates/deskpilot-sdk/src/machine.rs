//! Machine lifecycle management.
//!
//! A [`Machine`] tracks the last known lifecycle state of one local or remote
//! machine. Every lifecycle call is validated against the transition table in
//! [`deskpilot_core::lifecycle`] and serialized per machine: the control plane
//! does not guarantee idempotent concurrent transitions, so two calls on the
//! same machine never overlap. Calls on different machines are independent.
//!
//! State is committed only after the control plane accepts the request, with
//! one exception: `terminate` always ends in `Terminated`, even if releasing
//! the remote resources failed.

use std::future::Future;
use std::sync::Arc;

use deskpilot_core::lifecycle;
use deskpilot_core::{LifecycleEvent, LifecycleState, MachineId, MachineKind, Transition};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::shim::{self, Operation};
use crate::Client;

/// Status document returned by the control plane for a machine.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineStatus {
    /// Machine identifier.
    pub id: MachineId,
    /// Lifecycle status as reported by the server, if any.
    #[serde(default)]
    pub status: Option<String>,
    /// True while automation is paused for a human operator.
    #[serde(default)]
    pub pause_bots: bool,
}

/// Pull an `id` out of a create response, which is either an object or a
/// single-element list of objects.
pub(crate) fn extract_id(value: &Value) -> Result<String> {
    let record = match value {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    record
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Decode(format!("response has no id: {value}")))
}

#[derive(Debug, Clone)]
struct Slot {
    id: Option<MachineId>,
    state: LifecycleState,
}

#[derive(Debug)]
pub(crate) struct MachineShared {
    client: Client,
    kind: MachineKind,
    temporary: bool,
    slot: parking_lot::Mutex<Slot>,
    transitions: tokio::sync::Mutex<()>,
}

impl MachineShared {
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) const fn kind(&self) -> MachineKind {
        self.kind
    }

    fn snapshot(&self) -> Slot {
        self.slot.lock().clone()
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.slot.lock().state
    }

    fn commit(&self, id: Option<MachineId>, state: LifecycleState) {
        let mut slot = self.slot.lock();
        tracing::debug!(
            machine_id = ?id,
            from = %slot.state,
            to = %state,
            "Lifecycle transition committed"
        );
        slot.id = id;
        slot.state = state;
    }

    fn status_url(&self, id: &MachineId) -> String {
        self.client.remote_url(&format!("vms/{id}"))
    }

    /// Validate and apply one lifecycle event, holding the transition lock
    /// for the whole call.
    async fn apply(&self, event: LifecycleEvent) -> Result<()> {
        let _serial = self.transitions.lock().await;
        let Slot { id, state } = self.snapshot();

        let transition = lifecycle::transition(self.kind, state, event)
            .map_err(|e| Error::from_lifecycle(e, id.clone()))?;

        match transition {
            Transition::Unchanged => Ok(()),
            Transition::Local { settles_in } => {
                self.commit(id, settles_in);
                Ok(())
            }
            Transition::Remote { settles_in } => match self.remote(event, id.as_ref()).await {
                Ok(new_id) => {
                    if event == LifecycleEvent::Create {
                        tracing::info!(machine_id = ?new_id, "Created machine");
                        self.commit(new_id.clone(), LifecycleState::Created);
                    }
                    self.commit(new_id, settles_in);
                    Ok(())
                }
                Err(err) if event == LifecycleEvent::Terminate => {
                    tracing::warn!(
                        machine_id = ?id,
                        error = %err,
                        "Failed to release remote machine; marking terminated anyway"
                    );
                    self.commit(id, LifecycleState::Terminated);
                    Err(err)
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Issue the control-plane request for an event and return the machine's
    /// identity afterwards.
    async fn remote(&self, event: LifecycleEvent, id: Option<&MachineId>) -> Result<Option<MachineId>> {
        let api = self.client.api();
        if event == LifecycleEvent::Create {
            let response: Value = api.post(self.client.remote_url("vms"), None).await?;
            let raw = extract_id(&response)?;
            let id = MachineId::new(raw).map_err(|e| Error::Decode(e.to_string()))?;
            return Ok(Some(id));
        }

        let id = id.ok_or(Error::NotCreated)?;
        match event {
            LifecycleEvent::Start => api.put(self.client.remote_url(&format!("vms/{id}/start"))).await?,
            LifecycleEvent::Stop => api.put(self.client.remote_url(&format!("vms/{id}/stop"))).await?,
            LifecycleEvent::Terminate => api.delete(self.status_url(id)).await?,
            LifecycleEvent::Create | LifecycleEvent::Connect => {}
        }
        Ok(Some(id.clone()))
    }

    async fn connect(self: Arc<Self>) -> Result<Connection> {
        let _serial = self.transitions.lock().await;
        let Slot { id, state } = self.snapshot();
        lifecycle::transition(self.kind, state, LifecycleEvent::Connect)
            .map_err(|e| Error::from_lifecycle(e, id.clone()))?;

        match (self.kind, id) {
            (MachineKind::Remote, Some(machine_id)) => {
                let url = self.client.remote_url(&format!("vms/{machine_id}/connections"));
                let response: Value = self.client.api().post(url, None).await?;
                let raw = extract_id(&response)?;
                let connection_id = raw.parse().map_err(|e| Error::Decode(format!("{e}")))?;
                let connection = Connection::new(&self, Some(machine_id), Some(connection_id));
                tracing::info!("Connected to machine, watch the desktop here:");
                tracing::info!("-> {}", connection.viewer_url().unwrap_or_default());
                Ok(connection)
            }
            (MachineKind::Remote, None) => Err(Error::NotCreated),
            (MachineKind::Local, _) => Ok(Connection::new(&self, None, None)),
        }
    }

    async fn fetch_status(&self) -> Result<MachineStatus> {
        let id = match (self.kind, self.snapshot().id) {
            (MachineKind::Local, _) => {
                return Err(Error::Unsupported {
                    operation: "status".to_string(),
                    kind: MachineKind::Local,
                })
            }
            (MachineKind::Remote, Some(id)) => id,
            (MachineKind::Remote, None) => return Err(Error::NotCreated),
        };
        self.client.api().get_json(self.status_url(&id)).await
    }

    async fn refresh(&self) -> Result<LifecycleState> {
        if self.kind == MachineKind::Local {
            return Ok(self.state());
        }
        let status = self.fetch_status().await?;
        let _serial = self.transitions.lock().await;
        let Slot { id, state } = self.snapshot();
        if let Some(reported) = status.status.as_deref() {
            let reported = LifecycleState::from_remote_status(reported);
            // Never resurrect a terminated machine
            if state != LifecycleState::Terminated && reported != state {
                self.commit(id, reported);
            }
        }
        Ok(self.state())
    }

    /// Bring the machine to `Running` and open a connection.
    async fn open_session(self: Arc<Self>) -> Result<Connection> {
        if self.state() == LifecycleState::Unbound {
            self.apply(LifecycleEvent::Create).await?;
        }
        if self.kind == MachineKind::Remote && self.state() != LifecycleState::Running {
            self.apply(LifecycleEvent::Start).await?;
        }
        self.connect().await
    }
}

/// Releases a session on every exit path.
///
/// `release` hands cleanup to the background runtime and waits for it, so a
/// caller cancelled mid-cleanup cannot cut it short. If the guard is dropped
/// while still armed (panic, cancelled body) cleanup is spawned there too.
/// Either way it runs exactly once.
struct SessionGuard {
    shared: Arc<MachineShared>,
    connection: Option<Connection>,
    armed: bool,
}

impl SessionGuard {
    fn new(shared: Arc<MachineShared>) -> Self {
        Self {
            shared,
            connection: None,
            armed: true,
        }
    }

    fn take_cleanup(&mut self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.armed = false;
        cleanup(Arc::clone(&self.shared), self.connection.take())
    }

    async fn release(mut self) -> Result<()> {
        let work = self.take_cleanup();
        let (tx, rx) = oneshot::channel();
        let spawned = shim::spawn_background(async move {
            let _ = tx.send(work.await);
        });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "Background scheduler unavailable for session cleanup");
            return Err(err);
        }
        rx.await.unwrap_or(Err(Error::Detached))
    }

    fn release_blocking(mut self) -> Result<()> {
        Operation::new("session_cleanup", self.take_cleanup()).call()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let work = self.take_cleanup();
        let spawned = shim::spawn_background(async move {
            if let Err(err) = work.await {
                tracing::warn!(error = %err, "Session cleanup after abort failed");
            }
        });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "Could not schedule session cleanup");
        }
    }
}

/// Run `open_session` on the background runtime.
///
/// Cancelling the caller then cannot cut a create short between the request
/// and the commit, so cleanup always sees the identity of a machine the
/// server made. A connection opened after the caller gave up is closed here.
async fn open_detached(shared: Arc<MachineShared>) -> Result<Connection> {
    let (tx, rx) = oneshot::channel();
    shim::spawn_background(async move {
        let opened = Arc::clone(&shared).open_session().await;
        if let Err(Ok(orphan)) = tx.send(opened) {
            if let Err(err) = orphan.close().await {
                tracing::warn!(error = %err, "Failed to close abandoned connection");
            }
        }
    })?;
    rx.await.unwrap_or(Err(Error::Detached))
}

async fn cleanup(shared: Arc<MachineShared>, connection: Option<Connection>) -> Result<()> {
    if let Some(connection) = connection {
        if let Err(err) = connection.close().await {
            tracing::warn!(error = %err, "Failed to close connection");
        }
    }
    if !shared.temporary || shared.state() == LifecycleState::Terminated {
        return Ok(());
    }
    shared.apply(LifecycleEvent::Terminate).await
}

fn combine<T>(outcome: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (outcome, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), cleanup) => {
            if let Err(cleanup_err) = cleanup {
                tracing::warn!(error = %cleanup_err, "Session cleanup failed after body error");
            }
            Err(err)
        }
    }
}

/// A local or remote machine.
///
/// Lifecycle methods return an [`Operation`]: `.await` it inside a tokio
/// runtime or `.call()` it from blocking code.
#[derive(Debug)]
pub struct Machine {
    shared: Arc<MachineShared>,
}

impl Machine {
    fn build(client: Client, kind: MachineKind, temporary: bool, id: Option<MachineId>, state: LifecycleState) -> Self {
        Self {
            shared: Arc::new(MachineShared {
                client,
                kind,
                temporary,
                slot: parking_lot::Mutex::new(Slot { id, state }),
                transitions: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The server-issued identifier, once created.
    #[must_use]
    pub fn id(&self) -> Option<MachineId> {
        self.shared.snapshot().id
    }

    /// The last known lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Whether this is a local or a remote machine.
    #[must_use]
    pub fn kind(&self) -> MachineKind {
        self.shared.kind
    }

    /// Whether the machine is terminated when its session scope ends.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.shared.temporary
    }

    /// Create the machine on the control plane. Creation implies start.
    ///
    /// Valid only for an unbound remote machine. On failure the machine stays unbound.
    pub fn create(&self) -> Operation<()> {
        let shared = Arc::clone(&self.shared);
        Operation::new("create", async move { shared.apply(LifecycleEvent::Create).await })
    }

    /// Start the machine.
    ///
    /// Returns immediately without a remote call if it is already running.
    /// Fails with [`Error::TerminatedMachine`] if it has been terminated.
    pub fn start(&self) -> Operation<()> {
        let shared = Arc::clone(&self.shared);
        Operation::new("start", async move { shared.apply(LifecycleEvent::Start).await })
    }

    /// Stop a running machine.
    pub fn stop(&self) -> Operation<()> {
        let shared = Arc::clone(&self.shared);
        Operation::new("stop", async move { shared.apply(LifecycleEvent::Stop).await })
    }

    /// Terminate the machine and release its remote resources.
    ///
    /// The machine ends up `Terminated` even if the release request fails;
    /// that failure is still returned.
    pub fn terminate(&self) -> Operation<()> {
        let shared = Arc::clone(&self.shared);
        Operation::new("terminate", async move {
            shared.apply(LifecycleEvent::Terminate).await
        })
    }

    /// Open a connection to a running machine.
    pub fn connect(&self) -> Operation<Connection> {
        let shared = Arc::clone(&self.shared);
        Operation::new("connect", shared.connect())
    }

    /// Fetch the machine's status from the control plane.
    pub fn status(&self) -> Operation<MachineStatus> {
        let shared = Arc::clone(&self.shared);
        Operation::new("status", async move { shared.fetch_status().await })
    }

    /// Reconcile the local state with the state reported by the control plane.
    ///
    /// A terminated machine stays terminated whatever the server reports.
    pub fn refresh(&self) -> Operation<LifecycleState> {
        let shared = Arc::clone(&self.shared);
        Operation::new("refresh", async move { shared.refresh().await })
    }

    /// Whether automation is currently paused for a human operator.
    pub fn is_paused(&self) -> Operation<bool> {
        let shared = Arc::clone(&self.shared);
        Operation::new("is_paused", async move {
            Ok(shared.fetch_status().await?.pause_bots)
        })
    }

    /// Run `body` with a fresh connection, then clean up.
    ///
    /// The machine is created if unbound and started if not running. When
    /// `body` finishes, fails, or is cancelled, the connection is closed and a
    /// temporary machine is terminated, exactly once. A body error takes
    /// precedence over a cleanup error.
    ///
    /// # Errors
    ///
    /// Returns the first of: the error opening the session, the body's error,
    /// or the cleanup error.
    pub async fn session<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = SessionGuard::new(Arc::clone(&self.shared));
        let connection = match open_detached(Arc::clone(&self.shared)).await {
            Ok(connection) => connection,
            Err(err) => {
                let cleanup = guard.release().await;
                return combine(Err(err), cleanup);
            }
        };
        guard.connection = Some(connection.clone());

        let outcome = body(connection).await;
        let cleanup = guard.release().await;
        combine(outcome, cleanup)
    }

    /// Blocking form of [`session`](Self::session).
    ///
    /// Cleanup also runs if `body` panics.
    ///
    /// # Errors
    ///
    /// Returns `Error::AsyncContext` if called from inside a tokio runtime,
    /// otherwise as [`session`](Self::session).
    pub fn session_blocking<F, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if shim::in_async_context() {
            return Err(Error::AsyncContext);
        }

        let mut guard = SessionGuard::new(Arc::clone(&self.shared));
        let shared = Arc::clone(&self.shared);
        let connection = match Operation::new("open_session", shared.open_session()).call() {
            Ok(connection) => connection,
            Err(err) => {
                let cleanup = guard.release_blocking();
                return combine(Err(err), cleanup);
            }
        };
        guard.connection = Some(connection.clone());

        let outcome = body(&connection);
        let cleanup = guard.release_blocking();
        combine(outcome, cleanup)
    }
}

/// Factory for [`Machine`] handles.
#[derive(Debug, Clone)]
pub struct Machines {
    client: Client,
}

impl Machines {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// A remote machine that does not exist yet.
    #[must_use]
    pub fn remote(&self) -> Machine {
        Machine::build(self.client.clone(), MachineKind::Remote, false, None, LifecycleState::Unbound)
    }

    /// A remote machine that is terminated when its session scope ends.
    #[must_use]
    pub fn temporary(&self) -> Machine {
        Machine::build(self.client.clone(), MachineKind::Remote, true, None, LifecycleState::Unbound)
    }

    /// The machine behind the local backend. It is always running.
    #[must_use]
    pub fn local(&self) -> Machine {
        Machine::build(self.client.clone(), MachineKind::Local, false, None, LifecycleState::Running)
    }

    /// Create a new remote machine; it is running once this completes.
    pub fn create(&self) -> Operation<Machine> {
        let machine = self.remote();
        Operation::new("machines.create", async move {
            machine.shared.apply(LifecycleEvent::Create).await?;
            Ok(machine)
        })
    }

    /// Bind to an existing remote machine.
    ///
    /// The state is taken from the status the control plane reports; a
    /// machine reported without a status is assumed to be running.
    pub fn get(&self, id: MachineId) -> Operation<Machine> {
        let client = self.client.clone();
        Operation::new("machines.get", async move {
            let url = client.remote_url(&format!("vms/{id}"));
            let status: MachineStatus = client.api().get_json(url).await?;
            let state = status
                .status
                .as_deref()
                .map_or(LifecycleState::Running, LifecycleState::from_remote_status);
            tracing::debug!(machine_id = %id, state = %state, "Bound to existing machine");
            Ok(Machine::build(client, MachineKind::Remote, false, Some(id), state))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::{ApiRequest, Method, RecordingTransport, Reply, Transport};

    fn client(transport: &RecordingTransport) -> Client {
        let config = ClientConfig::default()
            .with_remote_url("http://control.test")
            .with_local_url("http://local.test");
        Client::with_transport(config, Arc::new(transport.clone()))
    }

    fn scripted() -> RecordingTransport {
        RecordingTransport::new()
            .on(Method::Post, "/vms", [Reply::Json(json!([{"id": "vm-1"}]))])
            .on(Method::Post, "/connections", [Reply::Json(json!([{"id": "conn-1"}]))])
    }

    #[test]
    fn extract_id_accepts_list_or_object() {
        assert_eq!(extract_id(&json!([{"id": "a"}])).unwrap(), "a");
        assert_eq!(extract_id(&json!({"id": "b"})).unwrap(), "b");
        assert!(matches!(extract_id(&json!([])), Err(Error::Decode(_))));
        assert!(extract_id(&json!({"id": 3})).is_err());
    }

    #[tokio::test]
    async fn create_assigns_identity_and_runs() {
        let transport = scripted();
        let machine = client(&transport).machines().remote();
        assert_eq!(machine.id(), None);
        assert_eq!(machine.state(), LifecycleState::Unbound);

        machine.create().await.unwrap();

        assert_eq!(machine.id().unwrap().as_str(), "vm-1");
        assert_eq!(machine.state(), LifecycleState::Running);
        assert_eq!(transport.calls_to(Method::Post, "/vms").len(), 1);
    }

    #[tokio::test]
    async fn failed_create_stays_unbound() {
        let transport =
            RecordingTransport::new().on(Method::Post, "/vms", [Reply::Status(402, "quota".into())]);
        let machine = client(&transport).machines().remote();

        let err = machine.create().await.unwrap_err();
        assert_eq!(err.status_code(), Some(402));
        assert_eq!(machine.state(), LifecycleState::Unbound);
        assert_eq!(machine.id(), None);
    }

    #[tokio::test]
    async fn start_when_running_makes_no_remote_call() {
        let transport = scripted();
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();
        transport.clear();

        let started = std::time::Instant::now();
        machine.start().await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_then_start_round_trip() {
        let transport = scripted();
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();

        machine.stop().await.unwrap();
        assert_eq!(machine.state(), LifecycleState::Stopped);
        machine.start().await.unwrap();
        assert_eq!(machine.state(), LifecycleState::Running);

        assert_eq!(transport.calls_to(Method::Put, "/vms/vm-1/stop").len(), 1);
        assert_eq!(transport.calls_to(Method::Put, "/vms/vm-1/start").len(), 1);
    }

    #[tokio::test]
    async fn failed_start_keeps_prior_state() {
        let transport = scripted().on(Method::Put, "/start", [Reply::Status(500, "boom".into())]);
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();
        machine.stop().await.unwrap();

        assert!(machine.start().await.is_err());
        assert_eq!(machine.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn terminated_machine_cannot_start() {
        let transport = scripted();
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();
        machine.terminate().await.unwrap();
        transport.clear();

        let err = machine.start().await.unwrap_err();
        assert!(matches!(err, Error::TerminatedMachine { machine_id: Some(_) }));
        assert_eq!(machine.state(), LifecycleState::Terminated);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn terminate_is_best_effort() {
        let transport = scripted().on(Method::Delete, "/vms/vm-1", [Reply::Status(503, "down".into())]);
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();

        let err = machine.terminate().await.unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(machine.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn terminate_unbound_is_local() {
        let transport = scripted();
        let machine = client(&transport).machines().temporary();
        machine.terminate().await.unwrap();
        assert_eq!(machine.state(), LifecycleState::Terminated);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn connect_requires_running() {
        let transport = scripted();
        let machine = client(&transport).machines().remote();
        let err = machine.connect().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: LifecycleState::Unbound,
                event: LifecycleEvent::Connect
            }
        ));

        machine.create().await.unwrap();
        let connection = machine.connect().await.unwrap();
        assert_eq!(connection.id().unwrap().as_str(), "conn-1");
        assert_eq!(connection.machine_id().unwrap().as_str(), "vm-1");
    }

    #[tokio::test]
    async fn local_machine_rules() {
        let transport = scripted();
        let machine = client(&transport).machines().local();
        assert_eq!(machine.state(), LifecycleState::Running);
        assert_eq!(machine.id(), None);

        machine.start().await.unwrap();
        assert!(matches!(machine.stop().await, Err(Error::Unsupported { .. })));
        assert!(matches!(machine.create().await, Err(Error::Unsupported { .. })));

        let connection = machine.connect().await.unwrap();
        assert!(connection.id().is_none());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn concurrent_transitions_are_serialized() {
        let transport = scripted();
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();
        machine.stop().await.unwrap();

        // Both race to start; only one remote start may happen
        let (a, b) = tokio::join!(machine.start().call_async(), machine.start().call_async());
        a.unwrap();
        b.unwrap();
        assert_eq!(transport.calls_to(Method::Put, "/start").len(), 1);
        assert_eq!(machine.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn get_binds_to_reported_state() {
        let transport = RecordingTransport::new()
            .on(Method::Get, "/vms/vm-7", [Reply::Json(json!({"id": "vm-7", "status": "Stopped"}))]);
        let machines = client(&transport).machines();

        let machine = machines.get(MachineId::new("vm-7").unwrap()).await.unwrap();
        assert_eq!(machine.state(), LifecycleState::Stopped);
        assert!(!machine.is_temporary());
    }

    #[tokio::test]
    async fn refresh_never_resurrects() {
        let transport = scripted()
            .on(Method::Get, "/vms/vm-1", [Reply::Json(json!({"id": "vm-1", "status": "running"}))]);
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();
        machine.terminate().await.unwrap();

        assert_eq!(machine.refresh().await.unwrap(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn refresh_follows_server() {
        let transport = scripted()
            .on(Method::Get, "/vms/vm-1", [Reply::Json(json!({"id": "vm-1", "status": "stopped"}))]);
        let machine = client(&transport).machines().remote();
        machine.create().await.unwrap();

        assert_eq!(machine.refresh().await.unwrap(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn temporary_session_terminates_once_on_error() {
        let transport = scripted();
        let machine = client(&transport).machines().temporary();

        let result: Result<()> = machine
            .session(|_conn| async {
                Err(Error::Remote {
                    status: 418,
                    body: "body failed".into(),
                })
            })
            .await;

        assert_eq!(result.unwrap_err().status_code(), Some(418));
        assert_eq!(machine.state(), LifecycleState::Terminated);
        assert_eq!(transport.calls_to(Method::Delete, "/vms/vm-1").len(), 1);
        assert_eq!(
            transport.calls_to(Method::Delete, "/vms/vm-1/connections/conn-1").len(),
            1
        );
        assert!(matches!(
            machine.start().await,
            Err(Error::TerminatedMachine { .. })
        ));
    }

    #[tokio::test]
    async fn non_temporary_session_keeps_machine() {
        let transport = scripted();
        let machine = client(&transport).machines().remote();

        let id = machine
            .session(|conn| async move { Ok(conn.id().cloned()) })
            .await
            .unwrap();

        assert_eq!(id.unwrap().as_str(), "conn-1");
        assert_eq!(machine.state(), LifecycleState::Running);
        assert!(transport.calls_to(Method::Delete, "/vms/vm-1").is_empty());
    }

    #[test]
    fn blocking_session_refused_inside_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let transport = scripted();
        let machine = client(&transport).machines().temporary();
        let result = runtime.block_on(async { machine.session_blocking(|_| Ok(())) });
        assert!(matches!(result, Err(Error::AsyncContext)));
        assert!(transport.calls().is_empty());
    }

    /// Holds create requests back so callers can give up mid-flight.
    #[derive(Debug, Clone)]
    struct SlowCreate {
        inner: RecordingTransport,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowCreate {
        async fn send(&self, request: ApiRequest) -> Result<Vec<u8>> {
            if request.method == Method::Post && request.url.ends_with("/vms") {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.send(request).await
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn session_cancelled_during_create_terminates_machine() {
        let transport = scripted();
        let slow = SlowCreate {
            inner: transport.clone(),
            delay: Duration::from_millis(200),
        };
        let config = ClientConfig::default().with_remote_url("http://control.test");
        let machine = Client::with_transport(config, Arc::new(slow)).machines().temporary();

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            machine.session(|_conn| async { Ok(()) }),
        )
        .await;
        assert!(result.is_err());

        eventually(|| transport.calls_to(Method::Delete, "/vms/vm-1").len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(transport.calls_to(Method::Post, "/vms").len(), 1);
        assert_eq!(transport.calls_to(Method::Delete, "/vms/vm-1").len(), 1);
        assert!(transport.calls_to(Method::Post, "/connections").is_empty());
        assert_eq!(machine.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn session_cancelled_in_body_terminates_once() {
        let transport = scripted();
        let machine = client(&transport).machines().temporary();

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            machine.session(|_conn| std::future::pending::<Result<()>>()),
        )
        .await;
        assert!(result.is_err());

        eventually(|| machine.state() == LifecycleState::Terminated).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.calls_to(Method::Delete, "/vms/vm-1").len(), 1);
        assert_eq!(
            transport.calls_to(Method::Delete, "/vms/vm-1/connections/conn-1").len(),
            1
        );
    }

    #[test]
    fn blocking_session_panic_still_terminates() {
        let transport = scripted();
        let machine = client(&transport).machines().temporary();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            machine.session_blocking(|_conn| -> Result<()> { panic!("body crashed") })
        }));
        assert!(outcome.is_err());

        for _ in 0..200 {
            if machine.state() == LifecycleState::Terminated {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(machine.state(), LifecycleState::Terminated);
        assert_eq!(transport.calls_to(Method::Delete, "/vms/vm-1").len(), 1);
        assert_eq!(
            transport.calls_to(Method::Delete, "/vms/vm-1/connections/conn-1").len(),
            1
        );
    }
}
