//! Client for the swf-monitor REST API.
//!
//! Agents use the monitor for three things: drawing a sequential agent id at
//! startup, registering the destinations they consume, and posting periodic
//! status heartbeats. [`HttpMonitorClient`] talks to a live monitor;
//! [`OfflineMonitor`] stands in when no monitor URL is configured.

use crate::config::MonitorConfig;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Monitor API failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    #[error("API request {method} {url} failed: {source}")]
    Http {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error(
        "API redirect (HTTP {status}) to {location} for {method} {url}; ensure API requests are not redirected and Authorization is forwarded"
    )]
    Redirect {
        status: u16,
        location: String,
        method: Method,
        url: String,
    },

    #[error("API request {method} {url} returned HTTP {status}: {body}")]
    Status {
        status: u16,
        method: Method,
        url: String,
        body: String,
    },

    #[error("API error: {0}")]
    Api(String),
}

impl MonitorError {
    /// A 400 reply saying the subscriber is already registered
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Status { status, body, .. } => {
                let body = body.to_lowercase();
                *status == StatusCode::BAD_REQUEST.as_u16()
                    && body.contains("already exists")
                    && body.contains("subscriber")
            }
            _ => false,
        }
    }
}

/// Agent status record posted to `/api/systemagents/heartbeat/`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusPayload {
    pub instance_name: String,
    pub agent_type: String,
    pub status: String,
    pub description: String,
    pub mq_connected: bool,
    pub pid: u32,
    pub hostname: String,
    pub operational_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stf_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_stf_processed: Option<u64>,
}

/// Subscriber record posted to `/api/subscribers/`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriberRegistration {
    pub subscriber_name: String,
    pub description: String,
    pub is_active: bool,
    pub fraction: f64,
}

/// Outcome of a subscriber registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    AlreadyExists,
}

/// Operations agents need from the monitor.
#[async_trait]
pub trait MonitorApi: Send + Sync {
    /// Next value of the persistent agent sequence
    async fn next_agent_id(&self) -> Result<String, MonitorError>;

    /// Next value of the persistent run-number sequence
    async fn next_run_number(&self) -> Result<String, MonitorError>;

    async fn heartbeat(&self, payload: &StatusPayload) -> Result<(), MonitorError>;

    async fn register_subscriber(
        &self,
        registration: &SubscriberRegistration,
    ) -> Result<Registration, MonitorError>;

    /// Whether the agent list endpoint answers
    async fn health_check(&self) -> bool;
}

/// Build the monitor collaborator for `config`.
pub fn from_config(config: &MonitorConfig) -> Result<Arc<dyn MonitorApi>, MonitorError> {
    match config.base_url() {
        Some(url) => Ok(Arc::new(HttpMonitorClient::new(
            url,
            config.api_token.as_deref(),
            config.timeout(),
        )?)),
        None => {
            warn!("No monitor URL configured, running without monitor");
            Ok(Arc::new(OfflineMonitor))
        }
    }
}

/// Monitor client over HTTP(S).
///
/// Redirects are never followed: a 3xx on an API path almost always means an
/// authentication proxy intercepted the request.
#[derive(Debug, Clone)]
pub struct HttpMonitorClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpMonitorClient {
    pub fn new(
        base_url: &str,
        api_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, MonitorError> {
        let base_url = base_url.trim_end_matches('/').to_owned();

        let mut headers = HeaderMap::new();
        if let Some(token) = api_token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Token {token}"))
                .map_err(|e| MonitorError::Api(format!("Invalid API token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .default_headers(headers);

        if is_local(&base_url) {
            debug!(url = %base_url, "Local monitor: bypassing proxies and certificate checks");
            builder = builder.no_proxy().danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| MonitorError::Api(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<B: Serialize + Sync + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<Value, MonitorError> {
        let url = format!("{}/api{endpoint}", self.base_url);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| MonitorError::Http {
            method: method.clone(),
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_owned();
            let err = MonitorError::Redirect {
                status: status.as_u16(),
                location,
                method,
                url,
            };
            error!(error = %err, "Monitor API redirected");
            return Err(err);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MonitorError::Status {
                status: status.as_u16(),
                method,
                url,
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|source| MonitorError::Http {
            method: method.clone(),
            url: url.clone(),
            source,
        })?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| MonitorError::Api(format!("Invalid JSON from {method} {url}: {e}")))
    }

    /// POST to a state-sequence endpoint and pull `field` out of a success reply.
    async fn next_in_sequence(&self, endpoint: &str, field: &str) -> Result<String, MonitorError> {
        let reply = self.request::<Value>(Method::POST, endpoint, None).await?;
        if reply.get("status").and_then(Value::as_str) != Some("success") {
            let reason = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return Err(MonitorError::Api(format!("{endpoint} returned error: {reason}")));
        }
        match reply.get(field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(MonitorError::Api(format!("{endpoint} reply has no {field}"))),
        }
    }
}

fn is_local(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1")
}

#[async_trait]
impl MonitorApi for HttpMonitorClient {
    async fn next_agent_id(&self) -> Result<String, MonitorError> {
        let id = self
            .next_in_sequence("/state/next-agent-id/", "agent_id")
            .await?;
        info!(agent_id = %id, "Got next agent id from persistent state");
        Ok(id)
    }

    async fn next_run_number(&self) -> Result<String, MonitorError> {
        let run = self
            .next_in_sequence("/state/next-run-number/", "run_number")
            .await?;
        info!(run_number = %run, "Got next run number from persistent state");
        Ok(run)
    }

    async fn heartbeat(&self, payload: &StatusPayload) -> Result<(), MonitorError> {
        self.request(Method::POST, "/systemagents/heartbeat/", Some(payload))
            .await?;
        debug!(
            instance = %payload.instance_name,
            status = %payload.status,
            mq_connected = payload.mq_connected,
            "Heartbeat delivered"
        );
        Ok(())
    }

    async fn register_subscriber(
        &self,
        registration: &SubscriberRegistration,
    ) -> Result<Registration, MonitorError> {
        match self
            .request(Method::POST, "/subscribers/", Some(registration))
            .await
        {
            Ok(_) => Ok(Registration::Created),
            Err(e) if e.is_already_exists() => Ok(Registration::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> bool {
        match self
            .request::<Value>(Method::GET, "/systemagents/", None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Monitor health check failed");
                false
            }
        }
    }
}

/// Monitor stand-in for agents running without a monitor.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineMonitor;

#[async_trait]
impl MonitorApi for OfflineMonitor {
    async fn next_agent_id(&self) -> Result<String, MonitorError> {
        Ok(std::process::id().to_string())
    }

    async fn next_run_number(&self) -> Result<String, MonitorError> {
        Err(MonitorError::Api(
            "no monitor configured to allocate run numbers".to_owned(),
        ))
    }

    async fn heartbeat(&self, payload: &StatusPayload) -> Result<(), MonitorError> {
        debug!(
            instance = %payload.instance_name,
            status = %payload.status,
            operational_state = %payload.operational_state,
            "Heartbeat (offline)"
        );
        Ok(())
    }

    async fn register_subscriber(
        &self,
        registration: &SubscriberRegistration,
    ) -> Result<Registration, MonitorError> {
        debug!(subscriber = %registration.subscriber_name, "Subscriber registration (offline)");
        Ok(Registration::Created)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
