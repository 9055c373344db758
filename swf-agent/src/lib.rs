#![forbid(unsafe_code)]

//! swf-agent: resilient messaging core for SWF testbed agents.
//!
//! One [`ConnectionManager`] owns the broker transport and the
//! [`SubscriptionRegistry`]. Inbound MESSAGE frames flow through the
//! [`MessageRouter`] to application [`MessageHandler`]s and are settled with
//! ACK or NACK on client-acknowledged subscriptions. The [`OutboundSender`]
//! retries a send once after reconnecting, and the [`StatusReporter`] keeps
//! the monitor informed. [`Agent`] ties these together into a run loop.
//!
//! ```no_run
//! use std::sync::Arc;
//! use swf_agent::{Agent, DestinationPattern, WorkflowLogger};
//! use swf_common::{ConfigLoader, monitor};
//! use swf_stomp::StompTransport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new("swf-agent").load()?;
//! let monitor = monitor::from_config(&config.monitor)?;
//! let agent = Agent::new(config, Box::new(StompTransport::new()), monitor, None).await?;
//! agent.route(DestinationPattern::prefix("/"), Arc::new(WorkflowLogger));
//! agent.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod connection;
pub mod error;
pub mod registry;
pub mod router;
pub mod sender;
pub mod status;

pub use agent::{Agent, SOFT_END, StopHandle, WorkflowLogger};
pub use connection::{
    ConnectionListener, ConnectionManager, ConnectionSettings, ConnectionState, ConnectionStats,
};
pub use error::{AgentError, HandlerError, Result};
pub use registry::{Subscription, SubscriptionRegistry, SubscriptionSpec};
pub use router::{
    Delivery, DestinationPattern, FnHandler, HandlerContext, MessageHandler, MessageRouter,
    PendingDelivery, WORKFLOW_MESSAGE_TYPES, WorkflowMessage,
};
pub use sender::{OutboundBody, OutboundSender, SendOutcome};
pub use status::{
    AgentIdentity, OperationalState, ProcessingGuard, StatusReporter, WorkflowMetadata,
};
