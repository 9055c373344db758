//! Outbound messages with a single reconnect-and-retry on connection loss.

use crate::connection::ConnectionManager;
use crate::error::{AgentError, Result};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use swf_stomp::{destination, validate_destination};
use tracing::{debug, error, info, warn};

/// Message body handed to [`OutboundSender::send`]
#[derive(Debug, Clone)]
pub enum OutboundBody {
    /// Structured body; objects get `sender` and `namespace` stamped in
    Json(Value),
    /// Bytes sent as-is
    Raw(Bytes),
}

impl From<Value> for OutboundBody {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for OutboundBody {
    fn from(bytes: Bytes) -> Self {
        Self::Raw(bytes)
    }
}

impl From<&str> for OutboundBody {
    fn from(text: &str) -> Self {
        Self::Raw(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<String> for OutboundBody {
    fn from(text: String) -> Self {
        Self::Raw(Bytes::from(text))
    }
}

/// How a send ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered on the first attempt
    Sent,
    /// Delivered by the retry after reconnecting
    SentAfterReconnect,
    /// Not delivered; already logged
    Lost,
}

impl SendOutcome {
    pub const fn is_sent(self) -> bool {
        !matches!(self, Self::Lost)
    }
}

/// Sends messages on behalf of one agent
#[derive(Clone)]
pub struct OutboundSender {
    manager: ConnectionManager,
    agent_name: Arc<str>,
    namespace: Option<Arc<str>>,
    retry_pause: Duration,
}

impl OutboundSender {
    pub fn new(
        manager: ConnectionManager,
        agent_name: impl Into<Arc<str>>,
        namespace: Option<String>,
        retry_pause: Duration,
    ) -> Self {
        Self {
            manager,
            agent_name: agent_name.into(),
            namespace: namespace.map(Into::into),
            retry_pause,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Send `body` to `destination`.
    ///
    /// An invalid destination fails with [`AgentError::Validation`] before
    /// any transport call. Transport failures never surface as errors: a
    /// lost connection triggers one reconnect and one retry, and anything
    /// still undelivered is reported as [`SendOutcome::Lost`].
    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<OutboundBody>,
        headers: &[(String, String)],
    ) -> Result<SendOutcome> {
        validate_destination(destination)?;
        let payload = self.encode(body.into())?;

        let first = match self.manager.send_frame(destination, &payload, headers).await {
            Ok(()) => {
                debug!(destination, bytes = payload.len(), "Message sent");
                return Ok(SendOutcome::Sent);
            }
            Err(e) => e,
        };

        if !first.is_connection_loss() {
            error!(
                destination,
                error = %first,
                "Failed to send message, message lost"
            );
            return Ok(SendOutcome::Lost);
        }

        warn!(
            destination,
            error = %first,
            "Connection lost while sending, attempting to reconnect"
        );
        self.manager.mark_disconnected(&first.to_string());
        tokio::time::sleep(self.retry_pause).await;

        if let Err(e) = self.manager.reconnect().await {
            error!(
                destination,
                error = %e,
                "Reconnection failed, message lost"
            );
            return Ok(SendOutcome::Lost);
        }

        match self.manager.send_frame(destination, &payload, headers).await {
            Ok(()) => {
                info!(destination, "Message sent after reconnection");
                Ok(SendOutcome::SentAfterReconnect)
            }
            Err(e) => {
                error!(
                    destination,
                    error = %e,
                    "Retry after reconnection failed, message lost"
                );
                Ok(SendOutcome::Lost)
            }
        }
    }

    /// Send to `/queue/<name>`
    pub async fn send_to_queue(
        &self,
        name: &str,
        body: impl Into<OutboundBody>,
    ) -> Result<SendOutcome> {
        self.send(&destination::queue(name), body, &[]).await
    }

    /// Send to `/topic/<name>`
    pub async fn send_to_topic(
        &self,
        name: &str,
        body: impl Into<OutboundBody>,
    ) -> Result<SendOutcome> {
        self.send(&destination::topic(name), body, &[]).await
    }

    fn encode(&self, body: OutboundBody) -> Result<Vec<u8>> {
        match body {
            OutboundBody::Raw(bytes) => Ok(bytes.to_vec()),
            OutboundBody::Json(mut value) => {
                if let Value::Object(fields) = &mut value {
                    fields.insert(
                        "sender".to_owned(),
                        Value::String(self.agent_name.to_string()),
                    );
                    match &self.namespace {
                        Some(ns) => {
                            fields.insert("namespace".to_owned(), Value::String(ns.to_string()));
                        }
                        None => {
                            let msg_type = fields
                                .get("msg_type")
                                .and_then(serde_json::Value::as_str)
                                .unwrap_or("unknown");
                            warn!(
                                msg_type,
                                "Sending message without namespace; configure the testbed namespace to enable filtering"
                            );
                        }
                    }
                }
                serde_json::to_vec(&value).map_err(AgentError::from)
            }
        }
    }
}
