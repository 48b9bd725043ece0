//! Commands, handlers and the remote channel seam.

use crate::error::{ProxyError, RemoteFault};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identity of one outstanding command. Valid only until it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A remote call plus the local rules that govern it.
///
/// `name` and `args` are handed to the channel untouched. `slot` makes the
/// command single-flight against every other command sharing the slot;
/// `requires` names a capability that must already be granted; `grants` and
/// `revokes` update the granted set when the command succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grants: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revokes: Option<String>,
}

impl RemoteCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Value::Null,
            slot: None,
            requires: None,
            grants: None,
            revokes: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn single_flight(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.requires = Some(capability.into());
        self
    }

    pub fn grants(mut self, capability: impl Into<String>) -> Self {
        self.grants = Some(capability.into());
        self
    }

    pub fn revokes(mut self, capability: impl Into<String>) -> Self {
        self.revokes = Some(capability.into());
        self
    }
}

/// How a command's deadline is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Time since issue.
    Total(Duration),
    /// Time since issue or since the last progress notification.
    Stall(Duration),
}

impl TimeoutPolicy {
    pub fn window(&self) -> Duration {
        match self {
            TimeoutPolicy::Total(d) | TimeoutPolicy::Stall(d) => *d,
        }
    }

    pub fn resets_on_progress(&self) -> bool {
        matches!(self, TimeoutPolicy::Stall(_))
    }
}

/// Caller-supplied completion handler.
///
/// Exactly one of `on_success` / `on_failure` is called per accepted command,
/// always on the dispatch task. `on_progress` may be called any number of
/// times before that.
pub trait CompletionHandler: Send + Sync {
    fn on_success(&self, result: Value);

    fn on_failure(&self, error: ProxyError);

    fn on_progress(&self, _progress: Value) {}
}

/// Capability for issuing calls to the remote service.
///
/// Handed to the proxy on every connect. Implementations must not block;
/// answers come back later through [`RemoteSink`](crate::RemoteSink).
pub trait RemoteChannel: Send + Sync {
    fn call(&self, id: CommandId, command: &RemoteCommand) -> Result<(), RemoteFault>;

    fn subscribe(&self, topic: &str) -> Result<(), RemoteFault>;

    fn unsubscribe(&self, topic: &str) -> Result<(), RemoteFault>;
}
