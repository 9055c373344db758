//! Shared helpers for swf-agent integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use swf_agent::{
    ConnectionManager, ConnectionSettings, HandlerContext, OutboundSender, StopHandle,
};
use swf_common::AgentConfig;
use swf_common::config::SubscriptionConfig;
use swf_common::monitor::{
    MonitorApi, MonitorError, Registration, StatusPayload, SubscriberRegistration,
};
use swf_stomp::frame::headers;
use swf_stomp::recording::{RecordingHandle, RecordingTransport};
use swf_stomp::{Command, ConnectParams, Frame, HeartBeat};

pub const AGENT_NAME: &str = "test-agent-user-1";

pub fn settings(attempts: u32) -> ConnectionSettings {
    ConnectionSettings {
        params: ConnectParams {
            host: "localhost".to_owned(),
            port: 61612,
            vhost: "localhost".to_owned(),
            login: "admin".to_owned(),
            passcode: "admin".to_owned(),
            client_id: AGENT_NAME.to_owned(),
            heart_beat: HeartBeat::new(30_000, 30_000),
            connect_timeout: Duration::from_secs(1),
            tls: None,
        },
        connect_attempts: attempts,
        retry_delay: Duration::from_millis(1),
    }
}

pub fn manager(attempts: u32) -> (ConnectionManager, RecordingHandle) {
    let (transport, handle) = RecordingTransport::new();
    (
        ConnectionManager::new(Box::new(transport), settings(attempts)),
        handle,
    )
}

pub async fn connected_manager() -> (ConnectionManager, RecordingHandle) {
    let (manager, handle) = manager(1);
    manager.connect().await.expect("connect");
    (manager, handle)
}

pub fn sender(manager: &ConnectionManager, namespace: Option<&str>) -> OutboundSender {
    OutboundSender::new(
        manager.clone(),
        AGENT_NAME,
        namespace.map(str::to_owned),
        Duration::from_millis(1),
    )
}

pub fn context(manager: &ConnectionManager) -> HandlerContext {
    HandlerContext {
        sender: sender(manager, Some("ns1")),
        stop: StopHandle::new(),
    }
}

/// MESSAGE frame as a STOMP 1.2 broker would deliver it
pub fn message(destination: &str, subscription: u64, id: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .with_header(headers::DESTINATION, destination)
        .with_header(headers::SUBSCRIPTION, subscription.to_string())
        .with_header(headers::MESSAGE_ID, format!("ID:{id}"))
        .with_header(headers::ACK, id)
        .with_body(body.to_owned())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn agent_config(subscriptions: &[&str]) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.agent_type = "TEST".to_owned();
    config.agent.subscriptions = subscriptions
        .iter()
        .map(|d| SubscriptionConfig::new(*d))
        .collect();
    config.broker.retry_delay_secs = 0;
    config.broker.send_retry_pause_ms = 1;
    config.runtime.poll_interval_secs = 1;
    config
}

/// In-memory monitor that records what the agent reports
#[derive(Default)]
pub struct MockMonitor {
    pub heartbeats: Mutex<Vec<StatusPayload>>,
    pub registrations: Mutex<Vec<SubscriberRegistration>>,
    pub reject_registration: AtomicBool,
    pub already_registered: AtomicBool,
    pub id_requests: AtomicUsize,
}

impl MockMonitor {
    pub fn states(&self) -> Vec<String> {
        self.heartbeats
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.operational_state.clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.heartbeats
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.status.clone())
            .collect()
    }
}

#[async_trait]
impl MonitorApi for MockMonitor {
    async fn next_agent_id(&self) -> Result<String, MonitorError> {
        let n = self.id_requests.fetch_add(1, Ordering::SeqCst);
        Ok((n + 1).to_string())
    }

    async fn next_run_number(&self) -> Result<String, MonitorError> {
        Ok("100".to_owned())
    }

    async fn heartbeat(&self, payload: &StatusPayload) -> Result<(), MonitorError> {
        self.heartbeats.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn register_subscriber(
        &self,
        registration: &SubscriberRegistration,
    ) -> Result<Registration, MonitorError> {
        if self.reject_registration.load(Ordering::SeqCst) {
            return Err(MonitorError::Api("registration refused".to_owned()));
        }
        self.registrations.lock().unwrap().push(registration.clone());
        if self.already_registered.load(Ordering::SeqCst) {
            Ok(Registration::AlreadyExists)
        } else {
            Ok(Registration::Created)
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}
