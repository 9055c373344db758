//! Agent identity and status reporting to the monitor.

use crate::connection::ConnectionManager;
use crate::error::Result;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use swf_common::MonitorApi;
use swf_common::monitor::{Registration, StatusPayload, SubscriberRegistration};
use tracing::{debug, info, warn};

/// Lifecycle stage reported in every status payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationalState {
    #[default]
    Starting,
    Ready,
    Processing,
    Exited,
}

impl OperationalState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Processing => "PROCESSING",
            Self::Exited => "EXITED",
        }
    }
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who this agent is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_type: String,
    /// `<type>-agent-<user>-<id>`, also used as the STOMP client id
    pub agent_name: String,
    pub namespace: Option<String>,
    pub pid: u32,
    pub hostname: String,
}

impl AgentIdentity {
    /// Build the identity, drawing the sequential id from the monitor.
    pub async fn resolve(
        agent_type: &str,
        namespace: Option<String>,
        monitor: &dyn MonitorApi,
    ) -> Result<Self> {
        let id = monitor.next_agent_id().await?;
        let identity = Self::with_id(agent_type, &id, namespace);
        info!(agent = %identity.agent_name, pid = identity.pid, "Agent identity resolved");
        Ok(identity)
    }

    /// Identity for a known sequence id
    pub fn with_id(agent_type: &str, id: &str, namespace: Option<String>) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_owned());
        Self {
            agent_type: agent_type.to_owned(),
            agent_name: format!("{}-agent-{user}-{id}", agent_type.to_lowercase()),
            namespace,
            pid: std::process::id(),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_owned()),
        }
    }
}

/// Counters for the workflow-aware heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowMetadata {
    pub active_tasks: u64,
    pub completed_tasks: u64,
    /// Extra `key: value` pairs appended to the description
    pub details: Vec<(String, String)>,
}

/// Builds status payloads and posts them through the monitor.
///
/// Heartbeats and status reports never fail the caller; subscriber
/// registration does.
#[derive(Clone)]
pub struct StatusReporter {
    identity: Arc<AgentIdentity>,
    manager: ConnectionManager,
    monitor: Arc<dyn MonitorApi>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

#[derive(Debug, Default)]
struct Lifecycle {
    state: OperationalState,
    /// Handlers currently running
    busy: usize,
}

/// Marks one handler as running; the agent returns to READY when the last
/// guard drops.
#[must_use = "processing ends when the guard is dropped"]
pub struct ProcessingGuard {
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.busy = lifecycle.busy.saturating_sub(1);
        if lifecycle.busy == 0 && lifecycle.state == OperationalState::Processing {
            debug!("Idle again, back to READY");
            lifecycle.state = OperationalState::Ready;
        }
    }
}

impl StatusReporter {
    pub fn new(
        identity: Arc<AgentIdentity>,
        manager: ConnectionManager,
        monitor: Arc<dyn MonitorApi>,
    ) -> Self {
        Self {
            identity,
            manager,
            monitor,
            lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn operational_state(&self) -> OperationalState {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn set_operational_state(&self, state: OperationalState) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if lifecycle.state != state {
            debug!(from = %lifecycle.state, to = %state, "Operational state changed");
            lifecycle.state = state;
        }
    }

    /// Report PROCESSING while the returned guard lives.
    ///
    /// Only a READY agent moves to PROCESSING; STARTING and EXITED stay put.
    pub fn begin_processing(&self) -> ProcessingGuard {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        lifecycle.busy += 1;
        if lifecycle.state == OperationalState::Ready {
            debug!("Operational state changed to PROCESSING");
            lifecycle.state = OperationalState::Processing;
        }
        ProcessingGuard {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    /// Status payload for the current connection and lifecycle state
    pub fn payload(&self) -> StatusPayload {
        let connected = self.manager.is_connected();
        let mq = if connected { "connected" } else { "disconnected" };
        self.build(
            if connected { "OK" } else { "WARNING" },
            format!("{} agent. MQ: {mq}", self.identity.agent_type),
        )
    }

    /// Post a liveness heartbeat. Returns whether the monitor accepted it.
    pub async fn heartbeat(&self) -> bool {
        let payload = self.payload();
        self.post(&payload, "Heartbeat").await
    }

    /// Heartbeat carrying workflow counters
    pub async fn heartbeat_with_workflow(&self, metadata: &WorkflowMetadata) -> bool {
        let mut payload = self.payload();
        for (key, value) in &metadata.details {
            payload.description.push_str(&format!(". {key}: {value}"));
        }
        payload.workflow_enabled = Some(true);
        payload.current_stf_count = Some(metadata.active_tasks);
        payload.total_stf_processed = Some(metadata.completed_tasks);
        self.post(&payload, "Workflow heartbeat").await
    }

    /// Report an explicit status such as a lifecycle transition.
    pub async fn report_status(
        &self,
        status: &str,
        message: Option<&str>,
        error_details: Option<&str>,
    ) -> bool {
        let mut description = format!("{} agent", self.identity.agent_type);
        if let Some(message) = message {
            description.push_str(". ");
            description.push_str(message);
        }
        if let Some(details) = error_details {
            description.push_str(". Error: ");
            description.push_str(details);
        }
        info!(status, "Reporting agent status");
        let payload = self.build(status, description);
        self.post(&payload, "Status report").await
    }

    /// Register the agent as a subscriber of each destination.
    ///
    /// An existing registration counts as success; any other failure is
    /// returned.
    pub async fn register_subscribers(&self, destinations: &[String]) -> Result<()> {
        for destination in destinations {
            let registration = SubscriberRegistration {
                subscriber_name: format!("{}-{destination}", self.identity.agent_name),
                description: format!(
                    "{} agent subscribing to {destination}",
                    self.identity.agent_type
                ),
                is_active: true,
                fraction: 1.0,
            };
            match self.monitor.register_subscriber(&registration).await? {
                Registration::Created => info!(
                    subscriber = %registration.subscriber_name,
                    "Subscriber registered"
                ),
                Registration::AlreadyExists => info!(
                    subscriber = %registration.subscriber_name,
                    "Subscriber already registered"
                ),
            }
        }
        Ok(())
    }

    pub async fn check_monitor_health(&self) -> bool {
        let healthy = self.monitor.health_check().await;
        if healthy {
            info!("Monitor API is healthy");
        } else {
            warn!("Monitor API is not responding");
        }
        healthy
    }

    fn build(&self, status: &str, description: String) -> StatusPayload {
        StatusPayload {
            instance_name: self.identity.agent_name.clone(),
            agent_type: self.identity.agent_type.clone(),
            status: status.to_owned(),
            description,
            mq_connected: self.manager.is_connected(),
            pid: self.identity.pid,
            hostname: self.identity.hostname.clone(),
            operational_state: self.operational_state().to_string(),
            namespace: self.identity.namespace.clone(),
            workflow_enabled: None,
            current_stf_count: None,
            total_stf_processed: None,
        }
    }

    async fn post(&self, payload: &StatusPayload, what: &str) -> bool {
        match self.monitor.heartbeat(payload).await {
            Ok(()) => {
                debug!(status = %payload.status, state = %payload.operational_state, "{what} sent");
                true
            }
            Err(e) => {
                warn!(error = %e, "{what} failed");
                false
            }
        }
    }
}
