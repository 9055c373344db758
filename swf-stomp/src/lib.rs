//! # swf-stomp
//!
//! STOMP wire layer used by SWF testbed agents.
//!
//! ## Features
//!
//! - **Frame codec**: STOMP 1.1/1.2 encoding and incremental decoding with
//!   header escaping, `content-length` bodies and EOL heart-beats
//! - **Destinations**: `/queue/` and `/topic/` validation and ack modes
//! - **Transport trait**: a session-oriented broker connection that reports
//!   inbound traffic as session-tagged events
//! - **TCP transport**: [`StompTransport`] with heart-beat negotiation,
//!   idle detection and optional TLS
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use swf_stomp::{ConnectParams, EventSink, HeartBeat, StompTransport, Transport};
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = ConnectParams {
//!         host: "localhost".to_owned(),
//!         port: 61612,
//!         vhost: "localhost".to_owned(),
//!         login: "admin".to_owned(),
//!         passcode: "admin".to_owned(),
//!         client_id: "data-agent-1".to_owned(),
//!         heart_beat: HeartBeat::new(30_000, 30_000),
//!         connect_timeout: Duration::from_secs(10),
//!         tls: None,
//!     };
//!
//!     let (tx, mut rx) = mpsc::channel(64);
//!     let mut transport = StompTransport::new();
//!     transport.connect(&params, EventSink::new(1, tx)).await?;
//!     transport.send("/topic/epictopic", b"{}", &[]).await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod destination;
pub mod error;
pub mod frame;
#[cfg(any(test, feature = "test-utils"))]
pub mod recording;
pub mod tcp;
pub mod tls;
pub mod transport;

pub use destination::{AckMode, DestinationKind, QUEUE_PREFIX, TOPIC_PREFIX, validate_destination};
pub use error::{BusError, CONNECTION_ERROR_KEYWORDS, Result, is_connection_error_text};
pub use frame::{Command, Decoded, Frame, HeartBeat};
pub use tcp::StompTransport;
pub use tls::TlsSettings;
pub use transport::{
    ConnectParams, EventSink, SessionEvent, SubscribeRequest, Transport, TransportEvent,
};
