//! Stall window: progress restarts it, silence expires it.

use super::harness::{Fixture, Outcome, Recorder, STALL_TIMEOUT};
use crate::command::RemoteCommand;
use crate::error::ProxyError;
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn fetch(kind: &str) -> RemoteCommand {
    RemoteCommand::new("fetch").with_args(json!({ "kind": kind }))
}

#[tokio::test(start_paused = true)]
async fn steady_progress_never_stalls() {
    let mut fx = Fixture::connected().await;
    let handler = Recorder::new();

    fx.proxy.enqueue("contacts", fetch("contacts"), handler.clone()).unwrap();
    let call = fx.next_call().await;

    // Twenty stall windows' worth of total time, never more than 80% of one
    // window between progress events.
    let interval = STALL_TIMEOUT * 4 / 5;
    for batch in 0..25 {
        sleep(interval).await;
        fx.sink.progress(call.id, json!({ "batch": batch }));
        fx.settle().await;
        assert_eq!(handler.terminal_count(), 0, "stalled at batch {batch}");
    }
    assert_eq!(handler.progress_count(), 25);

    fx.sink.completed(call.id, json!({ "entries": 250 }));
    assert_eq!(
        handler.terminal().await,
        Outcome::Success(json!({ "entries": 250 }))
    );
}

#[tokio::test(start_paused = true)]
async fn silence_times_out_after_exactly_the_window() {
    let mut fx = Fixture::connected().await;
    let handler = Recorder::new();

    fx.proxy.enqueue("contacts", fetch("contacts"), handler.clone()).unwrap();
    let call = fx.next_call().await;

    for _ in 0..3 {
        sleep(STALL_TIMEOUT / 2).await;
        fx.sink.progress(call.id, json!(null));
    }
    fx.settle().await;
    let last_progress = Instant::now();

    assert_eq!(
        handler.terminal().await,
        Outcome::Failure(ProxyError::Timeout(STALL_TIMEOUT))
    );
    let elapsed = last_progress.elapsed();
    assert!(elapsed >= STALL_TIMEOUT, "stalled early: {elapsed:?}");
    assert!(
        elapsed < STALL_TIMEOUT + Duration::from_millis(5),
        "stalled late: {elapsed:?}"
    );
    assert_eq!(handler.progress_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn stall_on_active_entry_promotes_the_next() {
    let mut fx = Fixture::connected().await;
    let stalled = Recorder::new();
    let next = Recorder::new();

    fx.proxy.enqueue("contacts", fetch("contacts"), stalled.clone()).unwrap();
    fx.proxy.enqueue("received", fetch("received"), next.clone()).unwrap();
    let first = fx.next_call().await;

    assert!(matches!(
        stalled.terminal().await,
        Outcome::Failure(ProxyError::Timeout(_))
    ));
    let second = fx.next_call().await;
    assert_eq!(second.command.args["kind"], "received");

    // The stalled fetch's answer shows up late and is dropped.
    fx.sink.completed(first.id, json!("late"));
    fx.sink.completed(second.id, json!("ok"));
    assert_eq!(next.terminal().await, Outcome::Success(json!("ok")));
    assert_eq!(stalled.outcomes().len(), 1);
    assert_eq!(fx.settle().await.queue_len, 0);
}

#[tokio::test(start_paused = true)]
async fn progress_does_not_extend_a_total_deadline() {
    let mut fx = Fixture::connected().await;
    let handler = Recorder::new();
    let window = Duration::from_millis(1000);

    let started = Instant::now();
    let id = fx
        .proxy
        .invoke_with_timeout(RemoteCommand::new("connect_device"), window, handler.clone())
        .unwrap();
    fx.next_call().await;

    for _ in 0..3 {
        sleep(Duration::from_millis(300)).await;
        fx.sink.progress(id, json!("pairing"));
    }

    assert_eq!(
        handler.terminal().await,
        Outcome::Failure(ProxyError::Timeout(window))
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= window && elapsed < window + Duration::from_millis(5));
    assert_eq!(handler.progress_count(), 3);
}
