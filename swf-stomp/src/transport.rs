//! Broker transport abstraction
//!
//! A [`Transport`] owns at most one live broker session. Inbound traffic is
//! not returned from calls; it is pushed as [`TransportEvent`]s into the
//! [`EventSink`] handed over on [`Transport::connect`], tagged with the
//! session number so that events from a torn-down session can be told apart
//! from the current one.

use crate::destination::AckMode;
use crate::error::Result;
use crate::frame::{Frame, HeartBeat};
use crate::tls::TlsSettings;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Parameters for establishing a broker session
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Broker host name or address
    pub host: String,
    /// Broker STOMP port
    pub port: u16,
    /// Virtual host sent in the CONNECT `host` header
    pub vhost: String,
    /// Login
    pub login: String,
    /// Passcode
    pub passcode: String,
    /// Durable client identifier
    pub client_id: String,
    /// Requested heart-beat intervals
    pub heart_beat: HeartBeat,
    /// Upper bound for TCP connect plus the CONNECT/CONNECTED exchange
    pub connect_timeout: Duration,
    /// Wrap the connection in TLS when set
    pub tls: Option<TlsSettings>,
}

impl ConnectParams {
    /// `host:port` string for socket addressing and logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SUBSCRIBE parameters for one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub id: u64,
    pub destination: String,
    pub ack: AckMode,
    pub prefetch: u32,
    pub selector: Option<String>,
}

impl SubscribeRequest {
    /// Wire frame for this request
    pub fn to_frame(&self) -> Frame {
        Frame::subscribe(
            self.id,
            &self.destination,
            self.ack,
            self.prefetch,
            self.selector.as_deref(),
        )
    }
}

/// Something the transport observed on the wire
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TransportEvent {
    /// CONNECTED received; carries the broker's headers
    Connected(Vec<(String, String)>),
    /// ERROR frame received
    Error(Frame),
    /// The session ended (EOF, socket error or missed heart-beats)
    Disconnected,
    /// MESSAGE frame received
    Message(Frame),
    /// RECEIPT frame received
    Receipt(String),
}

/// An event tagged with the session that produced it
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session: u64,
    pub event: TransportEvent,
}

/// Channel end used by a transport to report events for one session
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    /// Session number stamped on every event
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Deliver an event, waiting for channel capacity.
    ///
    /// Returns `false` once the receiving side is gone.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let delivered = self
            .tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .await
            .is_ok();
        if !delivered {
            debug!(session = self.session, "Event receiver dropped");
        }
        delivered
    }
}

/// A connection to a STOMP broker
#[async_trait]
pub trait Transport: Send {
    /// Open a session and complete the CONNECT/CONNECTED exchange.
    ///
    /// Any previous session must already be closed.
    async fn connect(&mut self, params: &ConnectParams, sink: EventSink) -> Result<()>;

    /// Close the session. Succeeds when there is nothing to close.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether a session is currently open
    fn is_connected(&self) -> bool;

    async fn subscribe(&mut self, request: &SubscribeRequest) -> Result<()>;

    async fn unsubscribe(&mut self, id: u64) -> Result<()>;

    async fn send(
        &mut self,
        destination: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<()>;

    async fn ack(&mut self, ack_id: &str, subscription: u64) -> Result<()>;

    async fn nack(&mut self, ack_id: &str, subscription: u64) -> Result<()>;
}
