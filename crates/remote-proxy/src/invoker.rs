//! Command invoker: the table of pending commands.
//!
//! Each accepted command gets its own [`DeadlineTimer`]. The answer and the
//! timer race through the timer's consumed flag: an answer that loses the race
//! is dropped and the already-posted expiry resolves the command instead.

use crate::command::{CommandId, CompletionHandler, RemoteChannel, RemoteCommand, TimeoutPolicy};
use crate::deadline::DeadlineTimer;
use crate::dispatch::{run_guarded, DispatchContext};
use crate::engine::ProxyEvent;
use crate::error::ProxyError;
use crate::session::SessionView;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

struct PendingCommand {
    command: RemoteCommand,
    handler: Arc<dyn CompletionHandler>,
    policy: TimeoutPolicy,
    timer: DeadlineTimer,
    issued_at: Instant,
    seq: u64,
    /// Slot claimed at admission, released when the command settles.
    held_slot: Option<String>,
}

pub(crate) struct CommandInvoker {
    pending: HashMap<CommandId, PendingCommand>,
    next_seq: u64,
    view: Arc<SessionView>,
    dispatch: DispatchContext<ProxyEvent>,
}

impl CommandInvoker {
    pub fn new(view: Arc<SessionView>, dispatch: DispatchContext<ProxyEvent>) -> Self {
        Self {
            pending: HashMap::new(),
            next_seq: 0,
            view,
            dispatch,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Send an accepted command to the remote service.
    ///
    /// `claimed_slot` says whether admission claimed the command's slot; only
    /// a claimed slot is released when the command settles.
    ///
    /// Returns true if the command is now pending, false if it was resolved
    /// on the spot (no channel, or the channel refused the call).
    pub fn issue(
        &mut self,
        channel: Option<&Arc<dyn RemoteChannel>>,
        id: CommandId,
        command: RemoteCommand,
        policy: TimeoutPolicy,
        handler: Arc<dyn CompletionHandler>,
        claimed_slot: bool,
    ) -> bool {
        let held_slot = if claimed_slot { command.slot.clone() } else { None };

        let Some(channel) = channel else {
            debug!(command_id = %id, command = %command.name, "Connection dropped before issue");
            self.settle(
                id,
                &command,
                held_slot.as_deref(),
                handler.as_ref(),
                Err(ProxyError::Disconnected),
                Duration::ZERO,
            );
            return false;
        };

        let mut timer = DeadlineTimer::new();
        self.arm(&mut timer, id, policy.window());

        debug!(
            command_id = %id,
            command = %command.name,
            timeout_ms = policy.window().as_millis() as u64,
            "Issuing remote command"
        );

        if let Err(fault) = channel.call(id, &command) {
            timer.cancel();
            warn!(command_id = %id, command = %command.name, error = %fault, "Remote call rejected");
            self.settle(
                id,
                &command,
                held_slot.as_deref(),
                handler.as_ref(),
                Err(ProxyError::RemoteFailure(fault.code)),
                Duration::ZERO,
            );
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            id,
            PendingCommand {
                command,
                handler,
                policy,
                timer,
                issued_at: Instant::now(),
                seq,
                held_slot,
            },
        );
        true
    }

    /// Apply a terminal answer from the remote service.
    ///
    /// Returns true if this answer resolved the command.
    pub fn complete(&mut self, id: CommandId, outcome: Result<Value, ProxyError>) -> bool {
        let Some(pending) = self.pending.get_mut(&id) else {
            debug!(command_id = %id, "Answer for unknown or already resolved command");
            return false;
        };

        if !pending.timer.cancel() {
            // The deadline fired first; its queued expiry resolves the command.
            debug!(command_id = %id, "Answer arrived after the deadline fired, ignoring");
            return false;
        }

        let Some(pending) = self.pending.remove(&id) else {
            return false;
        };
        let elapsed = pending.issued_at.elapsed();
        self.settle(
            id,
            &pending.command,
            pending.held_slot.as_deref(),
            pending.handler.as_ref(),
            outcome,
            elapsed,
        );
        true
    }

    /// Forward an intermediate progress notification.
    ///
    /// Stall-policy commands get their deadline restarted.
    pub fn progress(&mut self, id: CommandId, payload: Value) -> bool {
        let Some(pending) = self.pending.get_mut(&id) else {
            debug!(command_id = %id, "Progress for unknown or already resolved command");
            return false;
        };

        if pending.policy.resets_on_progress() {
            if !pending.timer.cancel() {
                debug!(command_id = %id, "Progress arrived after the stall deadline fired, ignoring");
                return false;
            }
            let window = pending.policy.window();
            let dispatch = self.dispatch.clone();
            pending.timer.start(window, move || expire(&dispatch, id));
        }

        trace!(command_id = %id, command = %pending.command.name, "Progress");
        let handler = pending.handler.clone();
        run_guarded("on_progress", || handler.on_progress(payload));
        true
    }

    /// Resolve a command whose deadline fired.
    pub fn expire(&mut self, id: CommandId) -> bool {
        let Some(pending) = self.pending.remove(&id) else {
            trace!(command_id = %id, "Deadline fired for a resolved command");
            return false;
        };

        let window = pending.policy.window();
        warn!(
            command_id = %id,
            command = %pending.command.name,
            timeout_ms = window.as_millis() as u64,
            "Command timed out"
        );
        let elapsed = pending.issued_at.elapsed();
        self.settle(
            id,
            &pending.command,
            pending.held_slot.as_deref(),
            pending.handler.as_ref(),
            Err(ProxyError::Timeout(window)),
            elapsed,
        );
        true
    }

    /// Cancel every deadline and resolve every pending command with `error`,
    /// in issue order. Returns the resolved ids in that order.
    pub fn fail_all(&mut self, error: ProxyError) -> Vec<CommandId> {
        let mut drained: Vec<(CommandId, PendingCommand)> = self.pending.drain().collect();
        drained.sort_by_key(|(_, pending)| pending.seq);

        let mut resolved = Vec::with_capacity(drained.len());
        for (id, mut pending) in drained {
            pending.timer.cancel();
            let elapsed = pending.issued_at.elapsed();
            self.settle(
                id,
                &pending.command,
                pending.held_slot.as_deref(),
                pending.handler.as_ref(),
                Err(error.clone()),
                elapsed,
            );
            resolved.push(id);
        }

        if !resolved.is_empty() {
            info!(count = resolved.len(), error = %error, "Resolved all pending commands");
        }
        resolved
    }

    fn arm(&self, timer: &mut DeadlineTimer, id: CommandId, window: Duration) {
        let dispatch = self.dispatch.clone();
        timer.start(window, move || expire(&dispatch, id));
    }

    fn settle(
        &self,
        id: CommandId,
        command: &RemoteCommand,
        held_slot: Option<&str>,
        handler: &dyn CompletionHandler,
        outcome: Result<Value, ProxyError>,
        elapsed: Duration,
    ) {
        if let Some(slot) = held_slot {
            self.view.release_slot(slot);
        }

        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(result) => {
                if let Some(capability) = &command.grants {
                    self.view.grant(capability);
                }
                if let Some(capability) = &command.revokes {
                    self.view.revoke(capability);
                }
                debug!(command_id = %id, command = %command.name, elapsed_ms, "Command succeeded");
                run_guarded("on_success", || handler.on_success(result));
            }
            Err(error) => {
                debug!(
                    command_id = %id,
                    command = %command.name,
                    elapsed_ms,
                    error = %error,
                    "Command failed"
                );
                run_guarded("on_failure", || handler.on_failure(error));
            }
        }
    }
}

fn expire(dispatch: &DispatchContext<ProxyEvent>, id: CommandId) {
    if dispatch.post(ProxyEvent::DeadlineExpired(id)).is_err() {
        trace!(command_id = %id, "Deadline fired after the proxy closed");
    }
}
