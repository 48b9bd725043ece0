//! Connection lifecycle: re-subscription and resolution of pending work.

use super::harness::{
    test_config, trace, Events, Fixture, Outcome, Recorder, ScriptedChannel, TopicOp,
};
use crate::command::RemoteCommand;
use crate::error::ProxyError;
use crate::proxy::RemoteProxy;
use crate::session::ConnectionState;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn listeners_survive_reconnect_without_reregistering() {
    let mut fx = Fixture::connected().await;
    let link = Events::new();
    let calls = Events::new();

    fx.proxy.register_listener("link_state", link.clone()).unwrap();
    fx.proxy.register_listener("call_state", calls.clone()).unwrap();
    fx.settle().await;
    assert_eq!(fx.channel.subscribe_count("link_state"), 1);
    assert_eq!(fx.channel.subscribe_count("call_state"), 1);

    fx.sink.notify("link_state", json!({ "connected": true }));
    fx.settle().await;
    assert_eq!(link.count(), 1);

    let restarted = fx.reconnect().await;
    assert_eq!(restarted.subscribe_count("link_state"), 1);
    assert_eq!(restarted.subscribe_count("call_state"), 1);

    fx.sink.notify("link_state", json!({ "connected": false }));
    fx.sink.notify("call_state", json!({ "state": "ringing" }));
    let status = fx.settle().await;
    assert_eq!(link.count(), 2);
    assert_eq!(calls.seen(), vec![("call_state".to_string(), json!({ "state": "ringing" }))]);
    assert_eq!(status.reconnects, 1);
    assert_eq!(status.listeners, 2);
    assert_eq!(status.state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn listeners_registered_while_disconnected_subscribe_on_connect() {
    let proxy = RemoteProxy::new(test_config()).unwrap();
    let events = Events::new();
    proxy.register_listener("media_state", events.clone()).unwrap();

    let (channel, _calls) = ScriptedChannel::new();
    proxy.sink().connected(channel.clone());
    proxy.status().await.unwrap();

    assert_eq!(channel.topic_ops(), vec![TopicOp::Subscribe("media_state".to_string())]);
    proxy.sink().notify("media_state", json!("playing"));
    proxy.status().await.unwrap();
    assert_eq!(events.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn shared_topic_is_subscribed_once() {
    let fx = Fixture::connected().await;
    let a = Events::new();
    let b = Events::new();

    let id_a = fx.proxy.register_listener("call_state", a.clone()).unwrap();
    let id_b = fx.proxy.register_listener("call_state", b.clone()).unwrap();
    fx.sink.notify("call_state", json!(1));
    fx.sink.notify("other_topic", json!(2));
    fx.settle().await;
    assert_eq!(fx.channel.subscribe_count("call_state"), 1);
    assert_eq!((a.count(), b.count()), (1, 1));

    fx.proxy.unregister_listener(id_a).unwrap();
    fx.sink.notify("call_state", json!(3));
    fx.settle().await;
    assert_eq!(fx.channel.unsubscribe_count("call_state"), 0);
    assert_eq!((a.count(), b.count()), (1, 2));

    fx.proxy.unregister_listener(id_b).unwrap();
    fx.settle().await;
    assert_eq!(fx.channel.unsubscribe_count("call_state"), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_resolves_commands_and_fetches() {
    let mut fx = Fixture::connected().await;
    let command = Recorder::new();
    let active = Recorder::new();
    let waiting = Recorder::new();

    fx.proxy
        .invoke(RemoteCommand::new("dial").single_flight("call"), command.clone())
        .unwrap();
    fx.proxy
        .enqueue("contacts", RemoteCommand::new("fetch"), active.clone())
        .unwrap();
    fx.proxy
        .enqueue("dialed", RemoteCommand::new("fetch"), waiting.clone())
        .unwrap();
    fx.next_call().await;
    fx.next_call().await;

    fx.sink.disconnected();
    for handler in [&command, &active, &waiting] {
        assert_eq!(
            handler.terminal().await,
            Outcome::Failure(ProxyError::Disconnected)
        );
    }

    let status = fx.settle().await;
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.pending_commands, 0);
    assert_eq!(status.queue_len, 0);
    assert_eq!(fx.proxy.connection_state(), ConnectionState::Disconnected);

    // Deadlines were cancelled: no spurious timeout later.
    sleep(Duration::from_secs(30)).await;
    fx.settle().await;
    for handler in [&command, &active, &waiting] {
        assert_eq!(handler.outcomes().len(), 1);
    }

    assert_eq!(
        fx.proxy.invoke(RemoteCommand::new("dial"), Recorder::new()),
        Err(ProxyError::NotConnected)
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_resolves_commands_in_issue_order() {
    let mut fx = Fixture::connected().await;
    let log = trace();
    let labels: Vec<String> = (0..8).map(|i| format!("cmd-{i}")).collect();

    // Paused clock: every command shares the same issue instant.
    for label in &labels {
        fx.proxy
            .invoke(RemoteCommand::new(label.as_str()), Recorder::traced(label, &log))
            .unwrap();
    }
    for _ in &labels {
        fx.next_call().await;
    }

    fx.sink.disconnected();
    fx.settle().await;

    let order: Vec<String> = log.lock().iter().map(|(label, _)| label.clone()).collect();
    assert_eq!(order, labels);
    assert!(log
        .lock()
        .iter()
        .all(|(_, outcome)| *outcome == Outcome::Failure(ProxyError::Disconnected)));
}

#[tokio::test(start_paused = true)]
async fn answers_from_before_a_reconnect_are_ignored() {
    let mut fx = Fixture::connected().await;
    let stale = Recorder::new();

    let old = fx
        .proxy
        .invoke(RemoteCommand::new("dial").single_flight("call"), stale.clone())
        .unwrap();
    fx.next_call().await;
    fx.reconnect().await;
    assert_eq!(stale.terminal().await, Outcome::Failure(ProxyError::Disconnected));

    let fresh = Recorder::new();
    let new = fx
        .proxy
        .invoke(RemoteCommand::new("dial").single_flight("call"), fresh.clone())
        .unwrap();
    fx.next_call().await;

    fx.sink.completed(old, json!("stale"));
    fx.settle().await;
    assert!(fresh.outcomes().is_empty());

    fx.sink.completed(new, json!("fresh"));
    assert_eq!(fresh.terminal().await, Outcome::Success(json!("fresh")));
    assert_eq!(stale.outcomes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_cycles_the_session() {
    let mut fx = Fixture::connected().await;
    let handler = Recorder::new();
    fx.proxy
        .invoke(RemoteCommand::new("dial"), handler.clone())
        .unwrap();
    fx.next_call().await;

    let (replacement, _calls) = ScriptedChannel::new();
    fx.sink.connected(replacement);
    assert_eq!(handler.terminal().await, Outcome::Failure(ProxyError::Disconnected));

    let status = fx.settle().await;
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_disconnect_is_harmless() {
    let fx = Fixture::connected().await;
    fx.sink.disconnected();
    fx.sink.disconnected();
    let status = fx.settle().await;
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.connected_since.is_none());
}
