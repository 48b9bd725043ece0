#![allow(dead_code)]

use bt_proxy::{BtProxy, Module, SimulatedService};
use parking_lot::Mutex;
use remote_proxy::{CompletionHandler, ProxyConfig, ProxyError, StateListener};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(60);
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);
pub const STALL_TIMEOUT: Duration = Duration::from_millis(500);
pub const LATENCY: Duration = Duration::from_millis(10);
pub const STEP_DELAY: Duration = Duration::from_millis(100);

pub fn config() -> ProxyConfig {
    ProxyConfig {
        dispatch_name: "bt-proxy-test".to_string(),
        command_timeout: COMMAND_TIMEOUT,
        stall_timeout: STALL_TIMEOUT,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Progress(Value),
    Success(Value),
    Failure(ProxyError),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Progress(_))
    }
}

pub type Trace = Arc<Mutex<Vec<(String, Outcome)>>>;

pub struct Recorder {
    label: String,
    outcomes: Mutex<Vec<Outcome>>,
    trace: Option<Trace>,
    notify: Notify,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Self::build(String::new(), None)
    }

    pub fn traced(label: &str, trace: &Trace) -> Arc<Self> {
        Self::build(label.to_string(), Some(trace.clone()))
    }

    fn build(label: String, trace: Option<Trace>) -> Arc<Self> {
        Arc::new(Self {
            label,
            outcomes: Mutex::new(Vec::new()),
            trace,
            notify: Notify::new(),
        })
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().clone()
    }

    pub async fn terminal(&self) -> Outcome {
        let wait = async {
            loop {
                let first = self
                    .outcomes
                    .lock()
                    .iter()
                    .find(|o| o.is_terminal())
                    .cloned();
                if let Some(outcome) = first {
                    return outcome;
                }
                self.notify.notified().await;
            }
        };
        timeout(WAIT, wait)
            .await
            .expect("timed out waiting for a terminal outcome")
    }

    fn record(&self, outcome: Outcome) {
        if let Some(trace) = &self.trace {
            trace.lock().push((self.label.clone(), outcome.clone()));
        }
        self.outcomes.lock().push(outcome);
        self.notify.notify_one();
    }
}

impl CompletionHandler for Recorder {
    fn on_success(&self, result: Value) {
        self.record(Outcome::Success(result));
    }

    fn on_failure(&self, error: ProxyError) {
        self.record(Outcome::Failure(error));
    }

    fn on_progress(&self, progress: Value) {
        self.record(Outcome::Progress(progress));
    }
}

#[derive(Default)]
pub struct Events {
    seen: Mutex<Vec<Value>>,
}

impl Events {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Value> {
        self.seen.lock().clone()
    }
}

impl StateListener for Events {
    fn on_event(&self, _topic: &str, payload: &Value) {
        self.seen.lock().push(payload.clone());
    }
}

/// A proxy wired to a simulated service that has not connected yet.
pub fn offline() -> (BtProxy, Arc<SimulatedService>) {
    let proxy = BtProxy::new(config()).expect("valid config");
    let service = Arc::new(
        SimulatedService::new(proxy.sink())
            .with_latency(LATENCY)
            .with_step_delay(STEP_DELAY),
    );
    (proxy, service)
}

/// A proxy connected to a simulated service.
pub async fn online() -> (BtProxy, Arc<SimulatedService>) {
    let (proxy, service) = offline();
    service.connect();
    proxy.status().await.expect("status");
    (proxy, service)
}

/// Open `module` and wait for the capability to be granted.
pub async fn open(proxy: &BtProxy, module: Module) {
    let handler = Recorder::new();
    proxy.open_module(module, handler.clone()).expect("open accepted");
    assert!(matches!(handler.terminal().await, Outcome::Success(_)));
    assert!(proxy.is_module_open(module));
}
