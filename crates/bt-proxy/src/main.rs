//! bt-proxy-sim entry point.
//!
//! Usage: bt-proxy-sim [--cycles <n>] [--latency-ms <ms>] [--json-logs]
//!
//! Drives the Bluetooth proxy against the in-process simulated service:
//! opens modules, downloads the phonebook, places a call, controls media,
//! then restarts the service and does it again.

use anyhow::Context;
use bt_proxy::{BtProxy, FetchScript, MediaAction, Module, PhonebookKind, SimulatedService, Topic};
use clap::Parser;
use remote_proxy::logging::{self, LogConfig};
use remote_proxy::{CommandId, CompletionHandler, ProxyConfig, ProxyError, ProxyResult, StateListener};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// bt-proxy-sim: exercise the Bluetooth proxy against a simulated service.
#[derive(Parser, Debug)]
#[command(name = "bt-proxy-sim")]
#[command(about = "Run the Bluetooth proxy against an in-process simulated service")]
struct Args {
    /// Number of service restarts after the first pass.
    #[arg(long, default_value = "1")]
    cycles: u32,

    /// Deadline for single-shot commands in milliseconds.
    #[arg(long, env = "PROXY_COMMAND_TIMEOUT_MS")]
    command_timeout_ms: Option<u64>,

    /// Stall window for phonebook downloads in milliseconds.
    #[arg(long, env = "PROXY_STALL_TIMEOUT_MS")]
    stall_timeout_ms: Option<u64>,

    /// Simulated service latency in milliseconds.
    #[arg(long, default_value = "20")]
    latency_ms: u64,

    /// Delay between phonebook batches in milliseconds.
    #[arg(long, default_value = "50")]
    step_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

/// Longest the driver waits for any single answer.
const REPORT_TIMEOUT: Duration = Duration::from_secs(60);

struct Report {
    label: String,
    outcome: Result<Value, ProxyError>,
}

struct Reporter {
    label: String,
    tx: mpsc::UnboundedSender<Report>,
}

impl Reporter {
    fn new(label: impl Into<String>, tx: &mpsc::UnboundedSender<Report>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            tx: tx.clone(),
        })
    }

    fn send(&self, outcome: Result<Value, ProxyError>) {
        let _ = self.tx.send(Report {
            label: self.label.clone(),
            outcome,
        });
    }
}

impl CompletionHandler for Reporter {
    fn on_success(&self, result: Value) {
        info!(op = %self.label, result = %result, "Succeeded");
        self.send(Ok(result));
    }

    fn on_failure(&self, error: ProxyError) {
        warn!(op = %self.label, error = %error, "Failed");
        self.send(Err(error));
    }

    fn on_progress(&self, progress: Value) {
        info!(op = %self.label, progress = %progress, "Progress");
    }
}

struct LogListener;

impl StateListener for LogListener {
    fn on_event(&self, topic: &str, payload: &Value) {
        info!(topic, payload = %payload, "State changed");
    }
}

struct Driver<'a> {
    proxy: &'a BtProxy,
    tx: mpsc::UnboundedSender<Report>,
    rx: mpsc::UnboundedReceiver<Report>,
}

impl<'a> Driver<'a> {
    fn new(proxy: &'a BtProxy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { proxy, tx, rx }
    }

    fn reporter(&self, label: impl Into<String>) -> Arc<dyn CompletionHandler> {
        Reporter::new(label, &self.tx)
    }

    async fn next(&mut self) -> anyhow::Result<Report> {
        tokio::time::timeout(REPORT_TIMEOUT, self.rx.recv())
            .await
            .context("timed out waiting for the proxy")?
            .context("report channel closed")
    }

    /// Wait for `accepted` commands to resolve.
    async fn collect(&mut self, accepted: usize) -> anyhow::Result<Vec<Report>> {
        let mut reports = Vec::with_capacity(accepted);
        for _ in 0..accepted {
            reports.push(self.next().await?);
        }
        Ok(reports)
    }

    /// Wait for one command, if it was accepted.
    async fn one(&mut self, accepted: ProxyResult<CommandId>) -> anyhow::Result<Report> {
        accepted?;
        self.next().await
    }

    async fn cycle(&mut self) -> anyhow::Result<()> {
        let proxy = self.proxy;

        let paired = self.one(proxy.query_paired_devices(self.reporter("query_paired_devices"))).await?;
        let address = paired
            .outcome
            .ok()
            .and_then(|devices| devices[0]["address"].as_str().map(str::to_string))
            .context("no paired device")?;
        self.one(proxy.connect_device(&address, self.reporter("connect_device"))).await?;

        for module in Module::ALL {
            proxy.open_module(module, self.reporter(format!("open {module}")))?;
        }
        self.collect(Module::ALL.len()).await?;

        let kinds = [
            PhonebookKind::Contacts,
            PhonebookKind::ReceivedCalls,
            PhonebookKind::DialedCalls,
        ];
        for kind in kinds {
            proxy.fetch_phonebook(kind, self.reporter(format!("fetch {kind}")))?;
        }
        for report in self.collect(kinds.len()).await? {
            if let Err(e) = report.outcome {
                info!(op = %report.label, error = %e, "Phonebook category unavailable");
            }
        }

        let dialing = proxy.dial("5551234", self.reporter("dial"));
        match proxy.answer_call(self.reporter("answer_call")) {
            Err(e) => info!(error = %e, "Call command rejected while dial is in flight"),
            Ok(_) => {
                self.next().await?;
            }
        }
        self.one(dialing).await?;
        self.one(proxy.hang_up(self.reporter("hang_up"))).await?;

        self.one(proxy.media_control(MediaAction::Play, self.reporter("play"))).await?;
        self.one(proxy.media_control(MediaAction::Pause, self.reporter("pause"))).await?;

        let status = proxy.status().await?;
        info!(status = %serde_json::to_string(&status)?, "Proxy status");

        for module in Module::ALL {
            proxy.close_module(module, self.reporter(format!("close {module}")))?;
        }
        self.collect(Module::ALL.len()).await?;
        self.one(proxy.disconnect_device(&address, self.reporter("disconnect_device"))).await?;
        Ok(())
    }
}

async fn run(proxy: &BtProxy, service: &Arc<SimulatedService>, cycles: u32) -> anyhow::Result<()> {
    for topic in [Topic::LinkState, Topic::CallState, Topic::MediaState] {
        proxy.register_listener(topic, Arc::new(LogListener))?;
    }

    service.connect();
    proxy.status().await?;

    let mut driver = Driver::new(proxy);
    for cycle in 0..=cycles {
        if cycle > 0 {
            info!(cycle, "Restarting simulated service");
            service.restart();
            proxy.status().await?;
        }
        driver.cycle().await?;
    }

    let status = proxy.status().await?;
    info!(
        reconnects = status.reconnects,
        listeners = status.listeners,
        calls = service.calls_received(),
        "Simulation finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init_with_config(LogConfig {
        service_name: "bt-proxy-sim".into(),
        default_level: args.log_level.clone(),
        json: args.json_logs,
        ..Default::default()
    });

    info!("bt-proxy-sim starting...");

    let mut config = ProxyConfig::from_env()?;
    if let Some(ms) = args.command_timeout_ms {
        config.command_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = args.stall_timeout_ms {
        config.stall_timeout = Duration::from_millis(ms);
    }
    config.validate()?;

    info!(
        dispatch = %config.dispatch_name,
        command_timeout_ms = config.command_timeout.as_millis() as u64,
        stall_timeout_ms = config.stall_timeout.as_millis() as u64,
        latency_ms = args.latency_ms,
        cycles = args.cycles,
        "Configuration loaded"
    );

    let proxy = BtProxy::new(config)?;
    let service = Arc::new(
        SimulatedService::new(proxy.sink())
            .with_latency(Duration::from_millis(args.latency_ms))
            .with_step_delay(Duration::from_millis(args.step_delay_ms))
            .with_script(PhonebookKind::Contacts, FetchScript::fail(2, 4))
            .with_script(PhonebookKind::ReceivedCalls, FetchScript::complete(0, 12))
            .with_script(PhonebookKind::DialedCalls, FetchScript::complete(1, 9)),
    );

    let ctrl_c = tokio::signal::ctrl_c();

    tokio::select! {
        result = run(&proxy, &service, args.cycles) => {
            if let Err(e) = result {
                error!(error = %e, "Simulation failed");
                proxy.teardown();
                proxy.closed().await;
                return Err(e);
            }
        }
        _ = ctrl_c => {
            info!("Received shutdown signal, exiting...");
        }
    }

    proxy.teardown();
    proxy.closed().await;
    Ok(())
}
