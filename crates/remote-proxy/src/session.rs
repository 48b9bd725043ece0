//! Connection session and subscription registry.
//!
//! ## State Diagram
//!
//! ```text
//! ┌──────────────┐  connected(channel)   ┌──────────────┐
//! │ Disconnected │ ────────────────────► │  Connected   │
//! │  (initial)   │ ◄──────────────────── │              │
//! └──────┬───────┘     disconnected()    └──────┬───────┘
//!        │                                      │
//!        └──────────── teardown() ──────────────┘
//!                          │
//!                          ▼
//!                 Disconnected (terminal)
//! ```
//!
//! Every entry into `Connected` re-issues every registered topic, since the
//! remote process may have restarted and lost its registrations.

use crate::command::{RemoteChannel, RemoteCommand};
use crate::dispatch::run_guarded;
use crate::error::{ProxyError, ProxyResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Identifies one registered state listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives continuous state-change notifications for one topic.
pub trait StateListener: Send + Sync {
    fn on_event(&self, topic: &str, payload: &Value);
}

struct Subscription {
    topic: String,
    listener: Arc<dyn StateListener>,
}

#[derive(Debug, Default)]
struct ViewState {
    state: ConnectionState,
    torn_down: bool,
    busy_slots: HashSet<String>,
    capabilities: HashSet<String>,
}

/// Synchronously readable mirror of the session.
///
/// Written only from the dispatch task, except for slot claims which the
/// facade makes at admission so that two racing callers cannot both pass.
#[derive(Debug, Default)]
pub(crate) struct SessionView {
    inner: Mutex<ViewState>,
}

impl SessionView {
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.lock().torn_down
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.inner.lock().capabilities.contains(capability)
    }

    /// Fail fast after teardown.
    pub fn ensure_live(&self) -> ProxyResult<()> {
        if self.is_torn_down() {
            return Err(ProxyError::Aborted);
        }
        Ok(())
    }

    /// Synchronous admission check. Claims the command's slot when asked to.
    pub fn admit(&self, command: &RemoteCommand, claim_slot: bool) -> ProxyResult<()> {
        let mut view = self.inner.lock();

        if view.torn_down {
            return Err(ProxyError::Aborted);
        }
        if view.state != ConnectionState::Connected {
            return Err(ProxyError::NotConnected);
        }
        require_capability(&view.capabilities, command)?;
        if claim_slot {
            if let Some(slot) = &command.slot {
                if !view.busy_slots.insert(slot.clone()) {
                    return Err(ProxyError::PreconditionFailed(format!(
                        "a `{}` command is already in flight",
                        slot
                    )));
                }
            }
        }
        Ok(())
    }

    /// Re-check a queued command's capability when it reaches the head.
    pub fn check_capability(&self, command: &RemoteCommand) -> ProxyResult<()> {
        require_capability(&self.inner.lock().capabilities, command)
    }

    pub fn release_slot(&self, slot: &str) {
        self.inner.lock().busy_slots.remove(slot);
    }

    pub fn grant(&self, capability: &str) {
        self.inner.lock().capabilities.insert(capability.to_string());
    }

    pub fn revoke(&self, capability: &str) {
        self.inner.lock().capabilities.remove(capability);
    }

    fn set_connected(&self, connected: bool) {
        let mut view = self.inner.lock();
        if connected {
            view.state = ConnectionState::Connected;
        } else {
            view.state = ConnectionState::Disconnected;
            view.capabilities.clear();
        }
    }

    /// Returns false if the view was already torn down.
    pub fn mark_torn_down(&self) -> bool {
        let mut view = self.inner.lock();
        let first = !view.torn_down;
        view.torn_down = true;
        view.state = ConnectionState::Disconnected;
        first
    }
}

fn require_capability(capabilities: &HashSet<String>, command: &RemoteCommand) -> ProxyResult<()> {
    match &command.requires {
        Some(capability) if !capabilities.contains(capability) => Err(ProxyError::PreconditionFailed(
            format!("`{}` requires `{}` to be open", command.name, capability),
        )),
        _ => Ok(()),
    }
}

/// Lifecycle of the link to the remote service.
pub(crate) struct ConnectionSession {
    state: ConnectionState,
    channel: Option<Arc<dyn RemoteChannel>>,
    subscriptions: BTreeMap<ListenerId, Subscription>,
    view: Arc<SessionView>,
    connected_since: Option<DateTime<Utc>>,
    connects: u64,
    terminal: bool,
}

impl ConnectionSession {
    pub fn new(view: Arc<SessionView>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            channel: None,
            subscriptions: BTreeMap::new(),
            view,
            connected_since: None,
            connects: 0,
            terminal: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn channel(&self) -> Option<&Arc<dyn RemoteChannel>> {
        self.channel.as_ref()
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.connected_since
    }

    /// Number of entries into `Connected` after the first one.
    pub fn reconnects(&self) -> u64 {
        self.connects.saturating_sub(1)
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Enter `Connected` and re-issue every registered topic.
    ///
    /// The caller is responsible for leaving `Connected` first.
    pub fn connect(&mut self, channel: Arc<dyn RemoteChannel>) {
        debug_assert!(!self.is_connected());

        self.state = ConnectionState::Connected;
        self.connected_since = Some(Utc::now());
        self.connects += 1;

        let topics = self.topics();
        for topic in &topics {
            if let Err(e) = channel.subscribe(topic) {
                warn!(topic = %topic, error = %e, "Failed to re-issue subscription");
            }
        }
        self.channel = Some(channel);
        self.view.set_connected(true);

        info!(
            reconnects = self.reconnects(),
            topics = topics.len(),
            listeners = self.subscriptions.len(),
            "Remote service connected"
        );
    }

    /// Leave `Connected`. Returns false if already disconnected.
    pub fn disconnect(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }

        self.state = ConnectionState::Disconnected;
        self.channel = None;
        self.connected_since = None;
        self.view.set_connected(false);

        info!("Remote service disconnected");
        true
    }

    pub fn add_listener(&mut self, id: ListenerId, topic: &str, listener: Arc<dyn StateListener>) {
        let new_topic = !self.has_topic(topic);
        self.subscriptions.insert(
            id,
            Subscription {
                topic: topic.to_string(),
                listener,
            },
        );

        if new_topic {
            if let Some(channel) = &self.channel {
                if let Err(e) = channel.subscribe(topic) {
                    warn!(topic = %topic, error = %e, "Failed to subscribe");
                }
            }
        }
        debug!(listener = %id, topic = %topic, "Listener registered");
    }

    /// Returns false if the listener was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let Some(removed) = self.subscriptions.remove(&id) else {
            return false;
        };

        if !self.has_topic(&removed.topic) {
            if let Some(channel) = &self.channel {
                if let Err(e) = channel.unsubscribe(&removed.topic) {
                    warn!(topic = %removed.topic, error = %e, "Failed to unsubscribe");
                }
            }
        }
        debug!(listener = %id, topic = %removed.topic, "Listener removed");
        true
    }

    /// Hand a notification to every listener of `topic`. Returns how many ran.
    pub fn deliver(&self, topic: &str, payload: &Value) -> usize {
        let mut delivered = 0;
        for sub in self.subscriptions.values().filter(|s| s.topic == topic) {
            run_guarded("state listener", || sub.listener.on_event(topic, payload));
            delivered += 1;
        }
        delivered
    }

    /// Drop every subscription and enter terminal `Disconnected`.
    pub fn teardown(&mut self) {
        if let Some(channel) = &self.channel {
            for topic in self.topics() {
                if let Err(e) = channel.unsubscribe(&topic) {
                    warn!(topic = %topic, error = %e, "Failed to unsubscribe during teardown");
                }
            }
        }

        let removed = self.subscriptions.len();
        self.subscriptions.clear();
        self.disconnect();
        self.terminal = true;
        self.view.mark_torn_down();

        info!(listeners = removed, "Connection session torn down");
    }

    fn has_topic(&self, topic: &str) -> bool {
        self.subscriptions.values().any(|s| s.topic == topic)
    }

    fn topics(&self) -> BTreeSet<String> {
        self.subscriptions.values().map(|s| s.topic.clone()).collect()
    }
}
