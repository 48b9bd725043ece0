//! Teardown finality.

use super::harness::{Events, Fixture, Outcome, Recorder, TopicOp};
use crate::command::RemoteCommand;
use crate::error::ProxyError;
use crate::session::ConnectionState;
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[tokio::test(start_paused = true)]
async fn teardown_releases_everything() {
    let mut fx = Fixture::connected().await;
    let command = Recorder::new();
    let active = Recorder::new();
    let waiting = Recorder::new();
    let events = Events::new();

    fx.proxy.register_listener("link_state", events.clone()).unwrap();
    let id = fx
        .proxy
        .invoke(RemoteCommand::new("dial").single_flight("call"), command.clone())
        .unwrap();
    fx.proxy
        .enqueue("contacts", RemoteCommand::new("fetch"), active.clone())
        .unwrap();
    fx.proxy
        .enqueue("received", RemoteCommand::new("fetch"), waiting.clone())
        .unwrap();
    fx.next_call().await;
    let fetch = fx.next_call().await;

    fx.proxy.teardown();
    for handler in [&command, &active, &waiting] {
        assert_eq!(handler.terminal().await, Outcome::Failure(ProxyError::Aborted));
    }
    timeout(Duration::from_secs(60), fx.proxy.closed())
        .await
        .expect("dispatch task did not stop");

    assert_eq!(
        fx.channel.topic_ops(),
        vec![
            TopicOp::Subscribe("link_state".to_string()),
            TopicOp::Unsubscribe("link_state".to_string()),
        ]
    );
    assert!(fx.proxy.is_torn_down());
    assert_eq!(fx.proxy.connection_state(), ConnectionState::Disconnected);

    // Nothing fires afterwards, whatever the transport does.
    fx.sink.completed(id, json!("late"));
    fx.sink.progress(fetch.id, json!("late"));
    fx.sink.notify("link_state", json!("late"));
    sleep(Duration::from_secs(30)).await;
    for handler in [&command, &active, &waiting] {
        assert_eq!(handler.outcomes().len(), 1);
    }
    assert_eq!(events.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn calls_after_teardown_are_aborted() {
    let fx = Fixture::connected().await;
    let listener = fx.proxy.register_listener("call_state", Events::new()).unwrap();
    fx.proxy.teardown();

    assert_eq!(
        fx.proxy.invoke(RemoteCommand::new("dial"), Recorder::new()),
        Err(ProxyError::Aborted)
    );
    assert_eq!(
        fx.proxy.enqueue("contacts", RemoteCommand::new("fetch"), Recorder::new()),
        Err(ProxyError::Aborted)
    );
    assert_eq!(
        fx.proxy.register_listener("call_state", Events::new()),
        Err(ProxyError::Aborted)
    );
    assert_eq!(fx.proxy.unregister_listener(listener), Err(ProxyError::Aborted));
    assert_eq!(fx.proxy.clear_queue(), Err(ProxyError::Aborted));

    fx.proxy.closed().await;
    assert_eq!(fx.proxy.status().await, Err(ProxyError::Aborted));
}

#[tokio::test(start_paused = true)]
async fn teardown_is_idempotent() {
    let fx = Fixture::connected().await;
    fx.proxy.teardown();
    fx.proxy.teardown();
    fx.proxy.closed().await;
    fx.proxy.teardown();
    fx.proxy.closed().await;
    assert!(fx.proxy.is_torn_down());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_proxy_tears_down() {
    let mut fx = Fixture::connected().await;
    let handler = Recorder::new();
    fx.proxy
        .invoke(RemoteCommand::new("dial"), handler.clone())
        .unwrap();
    fx.next_call().await;

    drop(fx);
    assert_eq!(handler.terminal().await, Outcome::Failure(ProxyError::Aborted));
}
