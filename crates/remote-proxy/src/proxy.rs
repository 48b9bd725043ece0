//! Public facade over the dispatch task.

use crate::command::{CommandId, CompletionHandler, RemoteChannel, RemoteCommand, TimeoutPolicy};
use crate::config::ProxyConfig;
use crate::dispatch::DispatchContext;
use crate::engine::{ProxyCore, ProxyEvent, ProxyStatus, StatusReply};
use crate::error::{ProxyError, ProxyResult};
use crate::session::{ConnectionState, ListenerId, SessionView, StateListener};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Proxy for one out-of-process service.
///
/// Every method returns immediately. Results arrive later on the dispatch
/// task through the handler supplied with the call. Must be created inside a
/// tokio runtime.
pub struct RemoteProxy {
    dispatch: DispatchContext<ProxyEvent>,
    view: Arc<SessionView>,
    config: ProxyConfig,
    next_listener: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteProxy {
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        config.validate()?;

        let view = Arc::new(SessionView::default());
        let (dispatch, task) = DispatchContext::spawn(config.dispatch_name.as_str());
        let core = ProxyCore::new(view.clone(), dispatch.clone(), config.stall_timeout);
        dispatch.subscribe(core)?;

        info!(
            dispatch = %config.dispatch_name,
            command_timeout_ms = config.command_timeout.as_millis() as u64,
            stall_timeout_ms = config.stall_timeout.as_millis() as u64,
            "Remote proxy started"
        );

        Ok(Self {
            dispatch,
            view,
            config,
            next_listener: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Handle for the transport side: connection changes, answers, progress
    /// and notifications.
    pub fn sink(&self) -> RemoteSink {
        RemoteSink {
            dispatch: self.dispatch.clone(),
        }
    }

    /// Last connection state applied on the dispatch task.
    pub fn connection_state(&self) -> ConnectionState {
        self.view.connection_state()
    }

    pub fn is_torn_down(&self) -> bool {
        self.view.is_torn_down()
    }

    /// True once a successful command has granted `capability` on the
    /// current connection.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.view.has_capability(capability)
    }

    /// Issue a single-shot command bounded by the configured command timeout.
    pub fn invoke(
        &self,
        command: RemoteCommand,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        self.invoke_with_timeout(command, self.config.command_timeout, handler)
    }

    pub fn invoke_with_timeout(
        &self,
        command: RemoteCommand,
        timeout: Duration,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        if timeout.is_zero() {
            return Err(ProxyError::PreconditionFailed(
                "command timeout must be greater than zero".to_string(),
            ));
        }
        self.view.admit(&command, true)?;

        let id = CommandId::new();
        let slot = command.slot.clone();
        debug!(command_id = %id, command = %command.name, slot = ?slot, "Command accepted");

        let posted = self.dispatch.post(ProxyEvent::Invoke {
            id,
            command,
            policy: TimeoutPolicy::Total(timeout),
            handler,
        });
        if let Err(e) = posted {
            if let Some(slot) = &slot {
                self.view.release_slot(slot);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Queue a multi-step fetch. Fetches run one at a time in FIFO order,
    /// each bounded by the stall timeout.
    pub fn enqueue(
        &self,
        kind: impl Into<String>,
        command: RemoteCommand,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        self.view.admit(&command, false)?;

        let id = CommandId::new();
        let kind = kind.into();
        trace!(command_id = %id, kind = %kind, "Fetch accepted");

        self.dispatch.post(ProxyEvent::Enqueue {
            id,
            kind,
            command,
            handler,
        })?;
        Ok(id)
    }

    /// Register a listener for `topic`. It stays registered across reconnects.
    pub fn register_listener(
        &self,
        topic: impl Into<String>,
        listener: Arc<dyn StateListener>,
    ) -> ProxyResult<ListenerId> {
        self.view.ensure_live()?;

        let id = ListenerId::new(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.dispatch.post(ProxyEvent::Register {
            id,
            topic: topic.into(),
            listener,
        })?;
        Ok(id)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> ProxyResult<()> {
        self.view.ensure_live()?;
        self.dispatch.post(ProxyEvent::Unregister(id))
    }

    /// Drop every waiting fetch without calling its handler. The active fetch
    /// is left to finish.
    pub fn clear_queue(&self) -> ProxyResult<()> {
        self.view.ensure_live()?;
        self.dispatch.post(ProxyEvent::ClearQueue)
    }

    /// Snapshot taken on the dispatch task after everything posted so far.
    pub async fn status(&self) -> ProxyResult<ProxyStatus> {
        let (tx, rx) = oneshot::channel();
        self.dispatch.post(ProxyEvent::Status(StatusReply::new(tx)))?;
        rx.await.map_err(|_| ProxyError::Aborted)
    }

    /// Release everything. Pending commands and queued fetches resolve with
    /// `Aborted`; later calls fail with `Aborted`. Idempotent.
    pub fn teardown(&self) {
        if !self.view.mark_torn_down() {
            return;
        }
        info!(dispatch = %self.config.dispatch_name, "Tearing down remote proxy");
        if self.dispatch.post(ProxyEvent::Teardown).is_err() {
            debug!("Dispatch context already closed at teardown");
        }
    }

    /// Wait for the dispatch task to stop after [`teardown`](Self::teardown).
    pub async fn closed(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(error = %e, "Dispatch task ended abnormally");
            }
        }
    }
}

impl Drop for RemoteProxy {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Cloneable transport-side handle. Safe to call from any thread.
#[derive(Clone)]
pub struct RemoteSink {
    dispatch: DispatchContext<ProxyEvent>,
}

impl RemoteSink {
    pub fn connected(&self, channel: Arc<dyn RemoteChannel>) {
        self.post(ProxyEvent::Connected(channel));
    }

    pub fn disconnected(&self) {
        self.post(ProxyEvent::Disconnected);
    }

    pub fn progress(&self, id: CommandId, payload: Value) {
        self.post(ProxyEvent::Progress { id, payload });
    }

    pub fn completed(&self, id: CommandId, result: Value) {
        self.post(ProxyEvent::Completed { id, result });
    }

    pub fn failed(&self, id: CommandId, code: i32) {
        self.post(ProxyEvent::Failed { id, code });
    }

    pub fn notify(&self, topic: impl Into<String>, payload: Value) {
        self.post(ProxyEvent::Notification {
            topic: topic.into(),
            payload,
        });
    }

    fn post(&self, event: ProxyEvent) {
        if self.dispatch.post(event).is_err() {
            trace!(dispatch = %self.dispatch.name(), "Dropping transport event after close");
        }
    }
}
