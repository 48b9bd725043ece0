//! Dispatch-side proxy state.
//!
//! `ProxyCore` is the only handler on the proxy's dispatch context and the
//! sole owner of the session, the pending-command table and the request
//! queue. Nothing here is locked; everything runs on the dispatch task.

use crate::command::{CommandId, CompletionHandler, RemoteChannel, RemoteCommand, TimeoutPolicy};
use crate::dispatch::{run_guarded, DispatchContext, EventHandler};
use crate::error::ProxyError;
use crate::invoker::CommandInvoker;
use crate::queue::{QueueEntry, RequestQueue, Waiting};
use crate::session::{ConnectionSession, ConnectionState, ListenerId, SessionView, StateListener};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Snapshot of the proxy, taken on the dispatch task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
    pub reconnects: u64,
    pub pending_commands: usize,
    pub queue_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_fetch: Option<String>,
    pub listeners: usize,
    pub torn_down: bool,
}

pub(crate) struct StatusReply(Mutex<Option<oneshot::Sender<ProxyStatus>>>);

impl StatusReply {
    pub fn new(tx: oneshot::Sender<ProxyStatus>) -> Self {
        Self(Mutex::new(Some(tx)))
    }

    fn send(&self, status: ProxyStatus) {
        if let Some(tx) = self.0.lock().take() {
            let _ = tx.send(status);
        }
    }
}

/// Everything that can happen to the proxy.
pub(crate) enum ProxyEvent {
    Connected(Arc<dyn RemoteChannel>),
    Disconnected,
    Invoke {
        id: CommandId,
        command: RemoteCommand,
        policy: TimeoutPolicy,
        handler: Arc<dyn CompletionHandler>,
    },
    Enqueue {
        id: CommandId,
        kind: String,
        command: RemoteCommand,
        handler: Arc<dyn CompletionHandler>,
    },
    Progress {
        id: CommandId,
        payload: Value,
    },
    Completed {
        id: CommandId,
        result: Value,
    },
    Failed {
        id: CommandId,
        code: i32,
    },
    DeadlineExpired(CommandId),
    Notification {
        topic: String,
        payload: Value,
    },
    Register {
        id: ListenerId,
        topic: String,
        listener: Arc<dyn StateListener>,
    },
    Unregister(ListenerId),
    ClearQueue,
    Status(StatusReply),
    Teardown,
}

impl ProxyEvent {
    fn name(&self) -> &'static str {
        match self {
            ProxyEvent::Connected(_) => "connected",
            ProxyEvent::Disconnected => "disconnected",
            ProxyEvent::Invoke { .. } => "invoke",
            ProxyEvent::Enqueue { .. } => "enqueue",
            ProxyEvent::Progress { .. } => "progress",
            ProxyEvent::Completed { .. } => "completed",
            ProxyEvent::Failed { .. } => "failed",
            ProxyEvent::DeadlineExpired(_) => "deadline_expired",
            ProxyEvent::Notification { .. } => "notification",
            ProxyEvent::Register { .. } => "register",
            ProxyEvent::Unregister(_) => "unregister",
            ProxyEvent::ClearQueue => "clear_queue",
            ProxyEvent::Status(_) => "status",
            ProxyEvent::Teardown => "teardown",
        }
    }
}

pub(crate) struct ProxyCore {
    session: ConnectionSession,
    invoker: CommandInvoker,
    queue: RequestQueue,
    view: Arc<SessionView>,
    dispatch: DispatchContext<ProxyEvent>,
}

impl ProxyCore {
    pub fn new(
        view: Arc<SessionView>,
        dispatch: DispatchContext<ProxyEvent>,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            session: ConnectionSession::new(view.clone()),
            invoker: CommandInvoker::new(view.clone(), dispatch.clone()),
            queue: RequestQueue::new(stall_timeout),
            view,
            dispatch,
        }
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus {
            state: self.session.state(),
            connected_since: self.session.connected_since(),
            reconnects: self.session.reconnects(),
            pending_commands: self.invoker.len(),
            queue_len: self.queue.len(),
            active_fetch: self.queue.active_kind().map(str::to_string),
            listeners: self.session.listener_count(),
            torn_down: self.session.is_terminal(),
        }
    }

    fn on_connected(&mut self, channel: &Arc<dyn RemoteChannel>) {
        if self.session.is_connected() {
            warn!("Connected while already connected, cycling the session");
            self.on_disconnected();
        }
        self.session.connect(channel.clone());
    }

    fn on_disconnected(&mut self) {
        if !self.session.disconnect() {
            debug!("Disconnect while already disconnected");
            return;
        }
        self.abandon(ProxyError::Disconnected);
    }

    /// Resolve all outstanding work with `error`: pending commands (including
    /// the active fetch) first, then waiting fetches in queue order.
    fn abandon(&mut self, error: ProxyError) {
        let (active, waiting) = self.queue.drain();
        let resolved = self.invoker.fail_all(error.clone());

        for discarded in &waiting {
            let handler = discarded.entry.handler.clone();
            let error = error.clone();
            run_guarded("on_failure", move || handler.on_failure(error));
        }

        if active.is_some() || !waiting.is_empty() || !resolved.is_empty() {
            info!(
                commands = resolved.len(),
                waiting_fetches = waiting.len(),
                error = %error,
                "Abandoned outstanding work"
            );
        }
    }

    fn on_enqueue(&mut self, id: CommandId, entry: QueueEntry) {
        let kind = entry.kind.clone();
        match self.queue.push(Waiting { id, entry }) {
            Some(head) => self.pump(Some(head)),
            None => debug!(
                command_id = %id,
                kind = %kind,
                position = self.queue.waiting_len(),
                "Fetch queued"
            ),
        }
    }

    /// Promote entries until one is actually in flight or the queue is empty.
    fn pump(&mut self, mut next: Option<Waiting>) {
        while let Some(head) = next.take() {
            let Waiting { id, entry } = head;
            self.queue.activate(id, &entry.kind);
            let channel = self.session.channel().cloned();

            // The module may have been closed while the entry was waiting.
            if channel.is_some() {
                if let Err(error) = self.view.check_capability(&entry.command) {
                    warn!(command_id = %id, kind = %entry.kind, error = %error, "Fetch no longer admissible");
                    let handler = entry.handler;
                    run_guarded("on_failure", move || handler.on_failure(error));
                    next = self.queue.finish(id);
                    continue;
                }
            }

            info!(
                command_id = %id,
                kind = %entry.kind,
                waiting = self.queue.waiting_len(),
                "Fetch started"
            );

            let policy = self.queue.stall_policy();
            if self
                .invoker
                .issue(channel.as_ref(), id, entry.command, policy, entry.handler, false)
            {
                break;
            }
            next = self.queue.finish(id);
        }
    }

    fn after_terminal(&mut self, id: CommandId, resolved: bool) {
        if resolved && self.queue.is_active(id) {
            let next = self.queue.finish(id);
            self.pump(next);
        }
    }

    fn on_teardown(&mut self) {
        self.abandon(ProxyError::Aborted);
        self.session.teardown();
        self.dispatch.close();
    }

    /// Events admitted just before teardown still get exactly one answer.
    fn reject_after_teardown(&self, event: &ProxyEvent) {
        match event {
            ProxyEvent::Invoke { command, handler, .. } | ProxyEvent::Enqueue { command, handler, .. } => {
                debug!(command = %command.name, "Command arrived after teardown");
                let handler = handler.clone();
                run_guarded("on_failure", move || handler.on_failure(ProxyError::Aborted));
            }
            ProxyEvent::Status(reply) => reply.send(self.status()),
            other => trace!(event = other.name(), "Ignoring event after teardown"),
        }
    }
}

impl EventHandler<ProxyEvent> for ProxyCore {
    fn handle(&mut self, event: &ProxyEvent) -> anyhow::Result<()> {
        if self.session.is_terminal() {
            self.reject_after_teardown(event);
            return Ok(());
        }

        trace!(event = event.name(), "Dispatching");

        match event {
            ProxyEvent::Connected(channel) => self.on_connected(channel),
            ProxyEvent::Disconnected => self.on_disconnected(),
            ProxyEvent::Invoke {
                id,
                command,
                policy,
                handler,
            } => {
                let channel = self.session.channel().cloned();
                self.invoker.issue(
                    channel.as_ref(),
                    *id,
                    command.clone(),
                    *policy,
                    handler.clone(),
                    true,
                );
            }
            ProxyEvent::Enqueue {
                id,
                kind,
                command,
                handler,
            } => self.on_enqueue(
                *id,
                QueueEntry {
                    kind: kind.clone(),
                    command: command.clone(),
                    handler: handler.clone(),
                },
            ),
            ProxyEvent::Progress { id, payload } => {
                self.invoker.progress(*id, payload.clone());
            }
            ProxyEvent::Completed { id, result } => {
                let resolved = self.invoker.complete(*id, Ok(result.clone()));
                self.after_terminal(*id, resolved);
            }
            ProxyEvent::Failed { id, code } => {
                let resolved = self
                    .invoker
                    .complete(*id, Err(ProxyError::RemoteFailure(*code)));
                self.after_terminal(*id, resolved);
            }
            ProxyEvent::DeadlineExpired(id) => {
                let resolved = self.invoker.expire(*id);
                self.after_terminal(*id, resolved);
            }
            ProxyEvent::Notification { topic, payload } => {
                let delivered = self.session.deliver(topic, payload);
                trace!(topic = %topic, delivered, "Notification delivered");
            }
            ProxyEvent::Register {
                id,
                topic,
                listener,
            } => self.session.add_listener(*id, topic, listener.clone()),
            ProxyEvent::Unregister(id) => {
                if !self.session.remove_listener(*id) {
                    debug!(listener = %id, "Unregister for unknown listener");
                }
            }
            ProxyEvent::ClearQueue => {
                // Waiting entries are dropped without a callback; the active
                // fetch runs to its own terminal outcome.
                let discarded = self.queue.clear_waiting();
                if !discarded.is_empty() {
                    info!(discarded = discarded.len(), "Discarded waiting fetches");
                }
            }
            ProxyEvent::Status(reply) => reply.send(self.status()),
            ProxyEvent::Teardown => self.on_teardown(),
        }

        Ok(())
    }
}
