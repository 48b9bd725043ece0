//! In-process stand-in for the Bluetooth control service.
//!
//! Answers every call after a fixed latency, plays scripted progress and
//! outcomes for phonebook downloads, and publishes notifications only for
//! topics the proxy has registered. `crash` and `restart` model the service
//! process dying: registrations are lost and replies still in flight from the
//! old process are never delivered.

use crate::types::{MediaAction, PhonebookKind, Topic};
use parking_lot::Mutex;
use remote_proxy::{CommandId, RemoteChannel, RemoteCommand, RemoteFault, RemoteSink};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Fault code for a command the service does not know.
pub const UNKNOWN_COMMAND: i32 = -38;
/// Fault code for malformed arguments.
pub const INVALID_ARGS: i32 = -22;

/// How a scripted download ends.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Complete(Value),
    Fail(i32),
    /// Never answers; the proxy's stall deadline has to end it.
    Stall,
}

/// Progress batches followed by an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchScript {
    pub batches: Vec<Value>,
    pub outcome: FetchOutcome,
}

impl FetchScript {
    pub fn complete(batches: usize, entries: u64) -> Self {
        Self {
            batches: (1..=batches).map(|n| json!({ "batch": n })).collect(),
            outcome: FetchOutcome::Complete(json!({ "entries": entries })),
        }
    }

    pub fn fail(batches: usize, code: i32) -> Self {
        Self {
            batches: (1..=batches).map(|n| json!({ "batch": n })).collect(),
            outcome: FetchOutcome::Fail(code),
        }
    }

    pub fn stall(batches: usize) -> Self {
        Self {
            batches: (1..=batches).map(|n| json!({ "batch": n })).collect(),
            outcome: FetchOutcome::Stall,
        }
    }
}

enum Step {
    Wait(Duration),
    Progress(Value),
    Complete(Value),
    Fail(i32),
    Notify(Topic, Value),
}

struct Shared {
    sink: RemoteSink,
    topics: Mutex<BTreeSet<String>>,
    generation: AtomicU64,
}

impl Shared {
    fn publish(&self, topic: Topic, payload: Value) {
        if self.topics.lock().contains(topic.as_str()) {
            self.sink.notify(topic.as_str(), payload);
        } else {
            trace!(topic = %topic, "No registration, notification not sent");
        }
    }
}

pub struct SimulatedService {
    shared: Arc<Shared>,
    latency: Duration,
    step_delay: Duration,
    scripts: Mutex<HashMap<PhonebookKind, FetchScript>>,
    calls: AtomicU64,
}

impl SimulatedService {
    pub fn new(sink: RemoteSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                topics: Mutex::new(BTreeSet::new()),
                generation: AtomicU64::new(0),
            }),
            latency: Duration::from_millis(20),
            step_delay: Duration::from_millis(50),
            scripts: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay between consecutive phonebook batches.
    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    pub fn with_script(self, kind: PhonebookKind, script: FetchScript) -> Self {
        self.scripts.lock().insert(kind, script);
        self
    }

    pub fn set_script(&self, kind: PhonebookKind, script: FetchScript) {
        self.scripts.lock().insert(kind, script);
    }

    /// Announce the service to the proxy.
    pub fn connect(self: &Arc<Self>) {
        info!("Simulated service up");
        self.shared.sink.connected(self.clone());
    }

    /// The service process dies. Nothing in flight is ever answered.
    pub fn crash(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.topics.lock().clear();
        info!("Simulated service crashed");
        self.shared.sink.disconnected();
    }

    /// Crash and come back as a fresh process.
    pub fn restart(self: &Arc<Self>) {
        self.crash();
        self.connect();
    }

    /// Publish a state change, if anyone registered for it.
    pub fn emit(&self, topic: Topic, payload: Value) {
        self.shared.publish(topic, payload);
    }

    pub fn registered_topics(&self) -> Vec<String> {
        self.shared.topics.lock().iter().cloned().collect()
    }

    pub fn calls_received(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn script_for(&self, kind: PhonebookKind) -> FetchScript {
        self.scripts
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| FetchScript::complete(1, 0))
    }

    fn plan(&self, command: &RemoteCommand) -> Result<Vec<Step>, RemoteFault> {
        let args = &command.args;
        let steps = match command.name.as_str() {
            "open_module" | "close_module" => vec![Step::Complete(json!({ "module": args["module"] }))],
            "connect_device" => {
                let address = string_arg(args, "address")?;
                vec![
                    Step::Complete(json!({ "address": address, "connected": true })),
                    Step::Notify(Topic::LinkState, json!({ "address": address, "connected": true })),
                ]
            }
            "disconnect_device" => {
                let address = string_arg(args, "address")?;
                vec![
                    Step::Complete(json!({ "address": address, "connected": false })),
                    Step::Notify(Topic::LinkState, json!({ "address": address, "connected": false })),
                ]
            }
            "query_paired_devices" => vec![Step::Complete(json!([
                { "address": "00:1A:7D:DA:71:13", "name": "Pixel" },
                { "address": "F4:5C:89:AB:10:02", "name": "iPhone" },
            ]))],
            "dial" => {
                let number = string_arg(args, "number")?;
                vec![
                    Step::Complete(json!({ "number": number })),
                    Step::Notify(Topic::CallState, json!({ "state": "dialing", "number": number })),
                ]
            }
            "answer_call" => vec![
                Step::Complete(Value::Null),
                Step::Notify(Topic::CallState, json!({ "state": "active" })),
            ],
            "hang_up" => vec![
                Step::Complete(Value::Null),
                Step::Notify(Topic::CallState, json!({ "state": "idle" })),
            ],
            "media_control" => {
                let action: MediaAction = serde_json::from_value(args["action"].clone())
                    .map_err(|e| RemoteFault::new(INVALID_ARGS, format!("bad media action: {e}")))?;
                vec![
                    Step::Complete(json!({ "action": action })),
                    Step::Notify(Topic::MediaState, json!({ "action": action })),
                ]
            }
            "fetch_phonebook" => {
                let kind: PhonebookKind = serde_json::from_value(args["kind"].clone())
                    .map_err(|e| RemoteFault::new(INVALID_ARGS, format!("bad phonebook kind: {e}")))?;
                self.fetch_steps(self.script_for(kind))
            }
            other => {
                return Err(RemoteFault::new(
                    UNKNOWN_COMMAND,
                    format!("unsupported command `{other}`"),
                ))
            }
        };
        Ok(steps)
    }

    fn fetch_steps(&self, script: FetchScript) -> Vec<Step> {
        let mut steps = Vec::with_capacity(script.batches.len() * 2 + 1);
        for batch in script.batches {
            steps.push(Step::Progress(batch));
            steps.push(Step::Wait(self.step_delay));
        }
        match script.outcome {
            FetchOutcome::Complete(result) => steps.push(Step::Complete(result)),
            FetchOutcome::Fail(code) => steps.push(Step::Fail(code)),
            FetchOutcome::Stall => {}
        }
        steps
    }
}

impl RemoteChannel for SimulatedService {
    fn call(&self, id: CommandId, command: &RemoteCommand) -> Result<(), RemoteFault> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let steps = self.plan(command)?;

        let shared = self.shared.clone();
        let generation = shared.generation.load(Ordering::Acquire);
        let latency = self.latency;
        let name = command.name.clone();
        debug!(command_id = %id, command = %name, steps = steps.len(), "Simulated call accepted");

        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            for step in steps {
                if shared.generation.load(Ordering::Acquire) != generation {
                    debug!(command_id = %id, command = %name, "Service restarted, reply lost");
                    return;
                }
                match step {
                    Step::Wait(delay) => tokio::time::sleep(delay).await,
                    Step::Progress(payload) => shared.sink.progress(id, payload),
                    Step::Complete(result) => shared.sink.completed(id, result),
                    Step::Fail(code) => shared.sink.failed(id, code),
                    Step::Notify(topic, payload) => shared.publish(topic, payload),
                }
            }
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), RemoteFault> {
        self.shared.topics.lock().insert(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), RemoteFault> {
        self.shared.topics.lock().remove(topic);
        Ok(())
    }
}

fn string_arg(args: &Value, field: &str) -> Result<String, RemoteFault> {
    args[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RemoteFault::new(INVALID_ARGS, format!("missing `{field}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_proxy::{ProxyConfig, RemoteProxy};

    #[tokio::test]
    async fn test_fetch_steps_interleave_waits() {
        let proxy = RemoteProxy::new(ProxyConfig::default()).unwrap();
        let service = SimulatedService::new(proxy.sink()).with_step_delay(Duration::from_millis(10));

        let steps = service.fetch_steps(FetchScript::fail(2, 4));
        assert_eq!(steps.len(), 5);
        assert!(matches!(steps[1], Step::Wait(d) if d == Duration::from_millis(10)));
        assert!(matches!(steps[4], Step::Fail(4)));

        let stalled = service.fetch_steps(FetchScript::stall(1));
        assert_eq!(stalled.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_calls_are_refused() {
        let proxy = RemoteProxy::new(ProxyConfig::default()).unwrap();
        let service = SimulatedService::new(proxy.sink());

        let fault = service.plan(&RemoteCommand::new("self_destruct")).err().unwrap();
        assert_eq!(fault.code, UNKNOWN_COMMAND);

        let fault = service
            .plan(&RemoteCommand::new("dial").with_args(json!({})))
            .err()
            .unwrap();
        assert_eq!(fault.code, INVALID_ARGS);

        let fault = service
            .plan(&RemoteCommand::new("fetch_phonebook").with_args(json!({ "kind": "recipes" })))
            .err()
            .unwrap();
        assert_eq!(fault.code, INVALID_ARGS);
    }
}
