//! Bluetooth control facade.
//!
//! One method per remote operation. Module open/close gate the commands that
//! need them; call control, media control and link management are each
//! single-flight; phonebook downloads go through the fetch queue.

use crate::types::{MediaAction, Module, PhonebookKind, Topic};
use remote_proxy::{
    CommandId, CompletionHandler, ListenerId, ProxyConfig, ProxyError, ProxyResult, ProxyStatus,
    RemoteCommand, RemoteProxy, RemoteSink, StateListener,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

const CALL_SLOT: &str = "call";
const MEDIA_SLOT: &str = "media";
const LINK_SLOT: &str = "link";

pub struct BtProxy {
    remote: RemoteProxy,
}

impl BtProxy {
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        Ok(Self {
            remote: RemoteProxy::new(config)?,
        })
    }

    /// Transport-side handle for the service connection.
    pub fn sink(&self) -> RemoteSink {
        self.remote.sink()
    }

    pub fn remote(&self) -> &RemoteProxy {
        &self.remote
    }

    pub fn is_module_open(&self, module: Module) -> bool {
        self.remote.has_capability(&module.capability())
    }

    pub fn open_module(
        &self,
        module: Module,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        let command = RemoteCommand::new("open_module")
            .with_args(json!({ "module": module }))
            .single_flight(module.capability())
            .grants(module.capability());
        self.remote.invoke(command, handler)
    }

    pub fn close_module(
        &self,
        module: Module,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        let command = RemoteCommand::new("close_module")
            .with_args(json!({ "module": module }))
            .single_flight(module.capability())
            .requires(module.capability())
            .revokes(module.capability());
        self.remote.invoke(command, handler)
    }

    pub fn connect_device(
        &self,
        address: &str,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        require_non_empty("address", address)?;
        let command = RemoteCommand::new("connect_device")
            .with_args(json!({ "address": address }))
            .single_flight(LINK_SLOT);
        self.remote.invoke(command, handler)
    }

    pub fn disconnect_device(
        &self,
        address: &str,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        require_non_empty("address", address)?;
        let command = RemoteCommand::new("disconnect_device")
            .with_args(json!({ "address": address }))
            .single_flight(LINK_SLOT);
        self.remote.invoke(command, handler)
    }

    pub fn query_paired_devices(&self, handler: Arc<dyn CompletionHandler>) -> ProxyResult<CommandId> {
        self.remote
            .invoke(RemoteCommand::new("query_paired_devices"), handler)
    }

    pub fn dial(&self, number: &str, handler: Arc<dyn CompletionHandler>) -> ProxyResult<CommandId> {
        require_non_empty("number", number)?;
        let command = phone_command("dial").with_args(json!({ "number": number }));
        self.remote.invoke(command, handler)
    }

    pub fn answer_call(&self, handler: Arc<dyn CompletionHandler>) -> ProxyResult<CommandId> {
        self.remote.invoke(phone_command("answer_call"), handler)
    }

    pub fn hang_up(&self, handler: Arc<dyn CompletionHandler>) -> ProxyResult<CommandId> {
        self.remote.invoke(phone_command("hang_up"), handler)
    }

    pub fn media_control(
        &self,
        action: MediaAction,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        let command = RemoteCommand::new("media_control")
            .with_args(json!({ "action": action }))
            .single_flight(MEDIA_SLOT)
            .requires(Module::Music.capability());
        self.remote.invoke(command, handler)
    }

    /// Queue a phonebook download. Downloads run one at a time; progress
    /// batches arrive through `on_progress`.
    pub fn fetch_phonebook(
        &self,
        kind: PhonebookKind,
        handler: Arc<dyn CompletionHandler>,
    ) -> ProxyResult<CommandId> {
        let command = RemoteCommand::new("fetch_phonebook")
            .with_args(json!({ "kind": kind }))
            .requires(Module::Phonebook.capability());
        let id = self.remote.enqueue(kind.as_str(), command, handler)?;
        debug!(command_id = %id, kind = %kind, "Phonebook fetch queued");
        Ok(id)
    }

    /// Drop queued phonebook downloads, e.g. when the phone's link goes away.
    /// The download already running is left to finish.
    pub fn cancel_fetches(&self) -> ProxyResult<()> {
        self.remote.clear_queue()
    }

    pub fn register_listener(
        &self,
        topic: Topic,
        listener: Arc<dyn StateListener>,
    ) -> ProxyResult<ListenerId> {
        self.remote.register_listener(topic.as_str(), listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> ProxyResult<()> {
        self.remote.unregister_listener(id)
    }

    pub async fn status(&self) -> ProxyResult<ProxyStatus> {
        self.remote.status().await
    }

    pub fn teardown(&self) {
        self.remote.teardown();
    }

    pub async fn closed(&self) {
        self.remote.closed().await;
    }
}

fn phone_command(name: &str) -> RemoteCommand {
    RemoteCommand::new(name)
        .single_flight(CALL_SLOT)
        .requires(Module::Phone.capability())
}

fn require_non_empty(field: &str, value: &str) -> ProxyResult<()> {
    if value.trim().is_empty() {
        return Err(ProxyError::PreconditionFailed(format!("{field} must not be empty")));
    }
    Ok(())
}
