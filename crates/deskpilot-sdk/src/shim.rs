//! Dual-mode execution of remote operations.
//!
//! Every SDK method returns an [`Operation`], which can be driven in two ways:
//!
//! - `.await` (or [`Operation::call_async`]) from inside any tokio runtime.
//!   No thread hop; the caller's own cancellation and timeouts apply.
//! - [`Operation::call`] from ordinary blocking code. The operation is handed
//!   to a single process-wide background runtime thread and the caller blocks
//!   until its result arrives.
//!
//! Calling the blocking form from a thread that is already inside a tokio
//! runtime fails with [`Error::AsyncContext`] without running the operation.
//! That includes code running on the background runtime itself, so an
//! operation cannot block on another operation through `call()`.
//!
//! ```no_run
//! use deskpilot_sdk::Operation;
//!
//! let op = Operation::new("answer", async { Ok(42) });
//! assert_eq!(op.call().unwrap(), 42);
//! ```

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::error::{Error, Result};

/// The background runtime, started on first blocking call.
static BACKGROUND: Mutex<Option<Background>> = parking_lot::const_mutex(None);

struct Background {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Background {
    fn start() -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("deskpilot-background".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                tracing::debug!("Background scheduler stopped");
            })
            .map_err(|e| Error::Runtime(format!("failed to spawn thread: {e}")))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| Error::Runtime("background thread exited during startup".to_string()))?
            .map_err(Error::Runtime)?;

        tracing::debug!("Background scheduler started");
        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

fn background_handle() -> Result<Handle> {
    let mut slot = BACKGROUND.lock();
    if let Some(background) = slot.as_ref() {
        return Ok(background.handle.clone());
    }
    let background = Background::start()?;
    let handle = background.handle.clone();
    *slot = Some(background);
    Ok(handle)
}

/// Returns true if the current thread is inside a tokio runtime context.
///
/// Blocking calls are refused in exactly this situation.
#[must_use]
pub fn in_async_context() -> bool {
    Handle::try_current().is_ok()
}

/// Returns true if the background runtime thread is currently running.
#[must_use]
pub fn background_running() -> bool {
    BACKGROUND.lock().is_some()
}

/// Stop the background runtime thread.
///
/// Operations still in flight on it are dropped, and their blocking callers
/// receive [`Error::Detached`]. A later blocking call starts a fresh thread.
pub fn shutdown_background() {
    let taken = BACKGROUND.lock().take();
    let Some(mut background) = taken else {
        return;
    };
    if let Some(tx) = background.shutdown.take() {
        let _ = tx.send(());
    }
    if let Some(thread) = background.thread.take() {
        // Joining from the background thread itself would never return
        if thread.thread().id() != thread::current().id() {
            let _ = thread.join();
        }
    }
}

/// Shuts the background runtime down when dropped.
///
/// Hold one in `main` to tear the runtime down before process exit.
#[derive(Debug, Default)]
#[must_use = "the background runtime is shut down when the guard is dropped"]
pub struct BackgroundGuard {
    _private: (),
}

impl BackgroundGuard {
    /// Create a guard.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        shutdown_background();
    }
}

/// Run a future to completion on the background runtime without waiting for it.
pub(crate) fn spawn_background<F>(future: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    background_handle()?.spawn(future);
    Ok(())
}

/// A single invocation of a remote operation, callable blocking or async.
///
/// An `Operation` is created fresh by each SDK method call and consumed by
/// whichever form drives it. Both forms run the same future, so they share
/// argument validation and produce identical results and errors.
#[must_use = "an operation does nothing until it is called or awaited"]
pub struct Operation<T> {
    name: &'static str,
    future: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> Operation<T> {
    /// Wrap a future as a dual-mode operation.
    pub fn new<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let span = tracing::debug_span!("operation", operation = name);
        Self {
            name,
            future: future.instrument(span).boxed(),
        }
    }

    /// An operation that resolves immediately to `result`.
    pub fn ready(name: &'static str, result: Result<T>) -> Self {
        Self::new(name, futures::future::ready(result))
    }

    /// The operation's name, used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Run the operation to completion, blocking the current thread.
    ///
    /// # Errors
    ///
    /// Returns `Error::AsyncContext` if called from inside a tokio runtime, in
    /// which case the operation is never started. Otherwise returns the
    /// operation's own error, or `Error::Detached` if the background runtime
    /// was shut down first.
    pub fn call(self) -> Result<T> {
        self.block(None)
    }

    /// Like [`call`](Self::call), but stop waiting after `timeout`.
    ///
    /// The operation keeps running on the background runtime after a
    /// timeout; its result is discarded.
    ///
    /// # Errors
    ///
    /// Returns `Error::TimedOut` if no result arrived in time, plus every error
    /// [`call`](Self::call) can return.
    pub fn call_timeout(self, timeout: Duration) -> Result<T> {
        self.block(Some(timeout))
    }

    /// Return the future for the caller's own runtime to drive.
    pub fn call_async(self) -> BoxFuture<'static, Result<T>> {
        self.future
    }

    fn block(self, timeout: Option<Duration>) -> Result<T> {
        if in_async_context() {
            tracing::warn!(
                operation = self.name,
                "Blocking call refused inside an async runtime"
            );
            return Err(Error::AsyncContext);
        }

        let handle = background_handle()?;
        let (tx, rx) = mpsc::sync_channel(1);
        let name = self.name;
        let future = self.future;

        handle.spawn(async move {
            let result = future.await;
            if tx.send(result).is_err() {
                tracing::debug!(operation = name, "Caller stopped waiting; result discarded");
            }
        });

        match timeout {
            None => rx.recv().unwrap_or(Err(Error::Detached)),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::TimedOut(timeout)),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::Detached),
            },
        }
    }
}

impl<T> IntoFuture for Operation<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.future
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").field("name", &self.name).finish_non_exhaustive()
    }
}
