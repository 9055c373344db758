#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{eventually, manager, message};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use swf_agent::{AgentError, ConnectionListener, ConnectionState, SubscriptionSpec};
use swf_stomp::recording::Call;
use swf_stomp::{AckMode, Frame};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn startup_connect_gives_up_after_configured_attempts() {
    let (manager, handle) = manager(3);
    handle.fail_next_connects(3);

    let err = manager.connect().await.expect_err("all attempts fail");
    match err {
        AgentError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handle.connect_count(), 3);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn startup_connect_succeeds_on_a_later_attempt() {
    let (manager, handle) = manager(3);
    handle.fail_next_connects(2);

    manager.connect().await.expect("third attempt succeeds");
    assert_eq!(handle.connect_count(), 3);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn subscriptions_recorded_offline_are_issued_on_connect() {
    let (manager, handle) = manager(1);
    let id = manager
        .add_subscription(SubscriptionSpec::new("/queue/x").ack(AckMode::ClientIndividual))
        .await
        .expect("valid");
    assert!(handle.subscribe_calls().is_empty());

    manager.connect().await.expect("connect");
    let calls = handle.subscribe_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, id);
    assert_eq!(calls[0].ack, AckMode::ClientIndividual);
}

#[tokio::test]
async fn reconnect_replays_each_subscription_once_with_the_same_id() {
    let (manager, handle) = manager(1);
    manager.connect().await.expect("connect");
    let id = manager
        .add_subscription(SubscriptionSpec::new("/queue/x").prefetch(4).selector("run = 1"))
        .await
        .expect("valid");

    handle.drop_connection().await;
    let mut state = manager.state_watch();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .expect("disconnect observed")
        .expect("watch open");

    handle.clear_calls();
    assert!(manager.reconnect().await.expect("reconnect"));

    let calls = handle.subscribe_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, id);
    assert_eq!(calls[0].destination, "/queue/x");
    assert_eq!(calls[0].prefetch, 4);
    assert_eq!(calls[0].selector.as_deref(), Some("run = 1"));
    assert!(manager.is_connected());
    assert_eq!(manager.stats().reconnect_attempts, 1);
}

#[tokio::test]
async fn replay_survives_a_refused_subscription() {
    let (manager, handle) = manager(1);
    for d in ["/queue/a", "/queue/b", "/topic/c"] {
        manager
            .add_subscription(SubscriptionSpec::new(d))
            .await
            .expect("valid");
    }
    handle.fail_subscriptions_to("/queue/b");

    manager.connect().await.expect("connect");
    let destinations: Vec<String> = handle
        .subscribe_calls()
        .into_iter()
        .map(|r| r.destination)
        .collect();
    assert_eq!(destinations, vec!["/queue/a", "/queue/b", "/topic/c"]);
    assert!(manager.is_connected());
    assert_eq!(manager.subscriptions().await.len(), 3);
}

#[tokio::test]
async fn failed_reconnect_leaves_state_disconnected() {
    let (manager, handle) = manager(1);
    manager.connect().await.expect("connect");
    handle.drop_connection().await;
    manager.mark_disconnected("test");
    handle.fail_next_connects(1);

    assert!(manager.reconnect().await.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.reconnect().await.expect("second try"));
}

#[tokio::test]
async fn disconnect_tears_down_and_tolerates_repeats() {
    let (manager, handle) = manager(1);
    manager.connect().await.expect("connect");

    manager.disconnect().await.expect("disconnect");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!handle.is_connected());
    manager.disconnect().await.expect("already disconnected");
    assert_eq!(
        handle
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Disconnect))
            .count(),
        1
    );
}

#[derive(Default)]
struct CountingListener {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    messages: AtomicUsize,
}

impl ConnectionListener for CountingListener {
    fn on_connected(&self, _headers: &[(String, String)]) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, _frame: &Frame) {
        self.messages.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn listeners_observe_the_lifecycle() {
    let (manager, handle) = manager(1);
    let listener = Arc::new(CountingListener::default());
    manager.add_listener(listener.clone());
    let mut deliveries = manager.take_delivery_receiver().expect("receiver");

    manager.connect().await.expect("connect");
    assert!(eventually(WAIT, || listener.connected.load(Ordering::SeqCst) == 1).await);

    assert!(handle.deliver(message("/queue/x", 1, "m1", "{}")).await);
    let frame = tokio::time::timeout(WAIT, deliveries.recv())
        .await
        .expect("delivered")
        .expect("channel open");
    assert_eq!(frame.header("destination"), Some("/queue/x"));
    assert_eq!(listener.messages.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().messages_received, 1);

    handle.drop_connection().await;
    assert!(eventually(WAIT, || listener.disconnected.load(Ordering::SeqCst) == 1).await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn wait_for_connected_resolves_after_connect() {
    let (manager, _handle) = manager(1);
    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.wait_for_connected(WAIT).await })
    };
    manager.connect().await.expect("connect");
    assert!(waiter.await.expect("joined"));
}

#[tokio::test]
async fn connected_is_published_after_subscriptions_are_restored() {
    let (manager, handle) = manager(1);
    for d in ["/queue/a", "/topic/b"] {
        manager
            .add_subscription(SubscriptionSpec::new(d))
            .await
            .expect("valid");
    }

    let mut state = manager.state_watch();
    let observer = {
        let handle = handle.clone();
        tokio::spawn(async move {
            state
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .expect("manager alive");
            handle.subscribe_calls().len()
        })
    };

    manager.connect().await.expect("connect");
    assert_eq!(observer.await.expect("joined"), 2);
}
