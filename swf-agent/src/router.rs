//! Inbound message routing and acknowledgment.
//!
//! Each subscription gets a lane: a worker that admits at most `prefetch`
//! deliveries into handlers at once. With prefetch 1 a subscription is
//! processed strictly in order; a slow handler only throttles its own lane.
//!
//! On client-acknowledged subscriptions every delivery ends in exactly one
//! ACK or NACK: a handler returning `Ok` acks, an error or panic nacks, and a
//! delivery with no matching handler is nacked so it is not left outstanding.
//! Auto-acknowledged subscriptions never produce ACK or NACK frames.

use crate::agent::StopHandle;
use crate::connection::ConnectionManager;
use crate::error::HandlerError;
use crate::sender::OutboundSender;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use swf_stomp::frame::headers;
use swf_stomp::{AckMode, Frame};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Workflow message types every agent recognizes
pub const WORKFLOW_MESSAGE_TYPES: [&str; 7] = [
    "run_imminent",
    "start_run",
    "pause_run",
    "resume_run",
    "end_run",
    "stf_gen",
    "data_ready",
];

/// Destination matcher used to select a handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DestinationPattern {
    /// Matches one destination exactly
    Exact(String),
    /// Matches every destination starting with the prefix
    Prefix(String),
}

impl DestinationPattern {
    pub fn exact(destination: impl Into<String>) -> Self {
        Self::Exact(destination.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn matches(&self, destination: &str) -> bool {
        match self {
            Self::Exact(d) => d == destination,
            Self::Prefix(p) => destination.starts_with(p.as_str()),
        }
    }
}

/// An inbound MESSAGE as seen by handlers
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: String,
    pub subscription: u64,
    pub message_id: String,
    /// Identifier echoed in ACK/NACK: the 1.2 `ack` header, else `message-id`
    pub ack_id: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Delivery {
    /// Build a delivery from a MESSAGE frame.
    ///
    /// Fails when the frame lacks a destination, a numeric subscription id or
    /// any delivery identifier.
    pub fn from_frame(frame: Frame) -> Result<Self, HandlerError> {
        let destination = frame
            .header(headers::DESTINATION)
            .ok_or_else(|| HandlerError::malformed("MESSAGE without destination header"))?
            .to_owned();
        let subscription = frame
            .header(headers::SUBSCRIPTION)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                HandlerError::malformed(format!(
                    "MESSAGE on {destination} without a valid subscription header"
                ))
            })?;
        let message_id = frame
            .header(headers::MESSAGE_ID)
            .unwrap_or_default()
            .to_owned();
        let ack_id = frame
            .header(headers::ACK)
            .map_or_else(|| message_id.clone(), str::to_owned);
        if ack_id.is_empty() {
            return Err(HandlerError::malformed(format!(
                "MESSAGE on {destination} without message-id or ack header"
            )));
        }

        Ok(Self {
            destination,
            subscription,
            message_id,
            ack_id,
            headers: frame.headers,
            body: frame.body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A client-acknowledged delivery awaiting ACK or NACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub destination: String,
    pub subscription: u64,
    pub ack_id: String,
    pub body: Bytes,
}

/// What a handler can reach while processing a delivery
#[derive(Clone)]
pub struct HandlerContext {
    pub sender: OutboundSender,
    pub stop: StopHandle,
}

impl HandlerContext {
    pub fn namespace(&self) -> Option<&str> {
        self.sender.namespace()
    }

    pub fn agent_name(&self) -> &str {
        self.sender.agent_name()
    }
}

/// Application callback for deliveries on matching destinations
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. `Ok` acknowledges it, `Err` rejects it.
    async fn handle(&self, delivery: &Delivery, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

/// [`MessageHandler`] backed by an async closure
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: &Delivery, ctx: &HandlerContext) -> Result<(), HandlerError> {
        (self.0)(delivery.clone(), ctx.clone()).await
    }
}

struct Lane {
    ack: AckMode,
    tx: mpsc::Sender<Delivery>,
}

struct Core {
    manager: ConnectionManager,
    context: HandlerContext,
    routes: RwLock<Vec<(DestinationPattern, Arc<dyn MessageHandler>)>>,
    lanes: StdMutex<HashMap<u64, Lane>>,
    pending: StdMutex<HashMap<String, PendingDelivery>>,
}

/// Dispatches deliveries to handlers and settles them with the broker.
#[derive(Clone)]
pub struct MessageRouter {
    core: Arc<Core>,
}

impl MessageRouter {
    pub fn new(manager: ConnectionManager, context: HandlerContext) -> Self {
        Self {
            core: Arc::new(Core {
                manager,
                context,
                routes: RwLock::new(Vec::new()),
                lanes: StdMutex::new(HashMap::new()),
                pending: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Register `handler` for `pattern`, replacing any handler on the same pattern.
    pub fn route(&self, pattern: DestinationPattern, handler: Arc<dyn MessageHandler>) {
        let mut routes = self
            .core
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = routes.iter_mut().find(|(p, _)| *p == pattern) {
            slot.1 = handler;
        } else {
            routes.push((pattern, handler));
        }
    }

    /// Queue a MESSAGE frame on its subscription's lane.
    ///
    /// Waits while the lane already holds `prefetch` undispatched deliveries,
    /// which in turn stalls the connection's event pump and the transport.
    pub async fn dispatch(&self, frame: Frame) {
        let delivery = match Delivery::from_frame(frame) {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = %e, "Dropping unusable delivery");
                return;
            }
        };

        let existing = self.lane_sender(delivery.subscription);
        let tx = match existing {
            Some(tx) => tx,
            None => self.open_lane(delivery.subscription).await,
        };
        if let Err(e) = tx.send(delivery).await {
            warn!(
                destination = %e.0.destination,
                "Subscription lane closed, delivery dropped"
            );
        }
    }

    /// Acknowledge a delivery explicitly.
    ///
    /// Returns `false` on auto-acknowledged subscriptions, for a delivery
    /// that is already settled, or when the transport call fails. A delivery
    /// acked here is not acked again when its handler returns.
    pub async fn ack(&self, delivery: &Delivery) -> bool {
        self.core.acknowledge(delivery, true).await
    }

    /// Reject a delivery explicitly. Same rules as [`MessageRouter::ack`].
    pub async fn nack(&self, delivery: &Delivery) -> bool {
        self.core.acknowledge(delivery, false).await
    }

    /// Snapshot of deliveries dispatched but not yet settled
    pub fn pending(&self) -> Vec<PendingDelivery> {
        self.core
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Dispatch frames until the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = rx.recv().await {
            self.dispatch(frame).await;
        }
        debug!("Delivery channel closed, router stopping");
    }

    pub fn spawn(self, rx: mpsc::Receiver<Frame>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    /// Drop the lane of a removed subscription.
    ///
    /// Deliveries already queued on it are still processed.
    pub fn close_lane(&self, subscription: u64) {
        let removed = self
            .core
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscription);
        if removed.is_some() {
            debug!(subscription, "Closed delivery lane");
        }
    }

    fn lane_sender(&self, subscription: u64) -> Option<mpsc::Sender<Delivery>> {
        self.core
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&subscription)
            .map(|lane| lane.tx.clone())
    }

    async fn open_lane(&self, subscription: u64) -> mpsc::Sender<Delivery> {
        let (ack, prefetch) = match self.core.manager.subscription(subscription).await {
            Some(s) => (s.ack, s.prefetch),
            None => {
                warn!(
                    subscription,
                    "Delivery for unknown subscription, treating as auto-acknowledged"
                );
                (AckMode::Auto, 1)
            }
        };

        let mut lanes = self
            .core
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lane) = lanes.get(&subscription) {
            return lane.tx.clone();
        }
        let depth = usize::try_from(prefetch).unwrap_or(1).max(1);
        let (tx, rx) = mpsc::channel(depth);
        tokio::spawn(run_lane(Arc::downgrade(&self.core), ack, depth, rx));
        lanes.insert(
            subscription,
            Lane {
                ack,
                tx: tx.clone(),
            },
        );
        debug!(subscription, ack = %ack, prefetch, "Opened delivery lane");
        tx
    }
}

/// Runs at most `prefetch` handlers at once. A delivery is only taken off
/// the lane once a permit is free.
async fn run_lane(
    core: Weak<Core>,
    ack: AckMode,
    prefetch: usize,
    mut rx: mpsc::Receiver<Delivery>,
) {
    let permits = Arc::new(Semaphore::new(prefetch));
    loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some(delivery) = rx.recv().await else {
            break;
        };
        let Some(core) = core.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            core.process(delivery, ack).await;
            drop(permit);
        });
    }
}

impl Core {
    fn handler_for(&self, destination: &str) -> Option<Arc<dyn MessageHandler>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, handler)) = routes
            .iter()
            .find(|(p, _)| matches!(p, DestinationPattern::Exact(d) if d == destination))
        {
            return Some(Arc::clone(handler));
        }
        routes
            .iter()
            .filter_map(|(p, h)| match p {
                DestinationPattern::Prefix(prefix) if destination.starts_with(prefix.as_str()) => {
                    Some((prefix.len(), h))
                }
                _ => None,
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| Arc::clone(h))
    }

    async fn process(&self, delivery: Delivery, ack: AckMode) {
        let manual = ack.requires_ack();
        if manual {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    delivery.ack_id.clone(),
                    PendingDelivery {
                        destination: delivery.destination.clone(),
                        subscription: delivery.subscription,
                        ack_id: delivery.ack_id.clone(),
                        body: delivery.body.clone(),
                    },
                );
        }

        let accepted = match self.handler_for(&delivery.destination) {
            None => {
                warn!(
                    destination = %delivery.destination,
                    message_id = %delivery.message_id,
                    "No handler for destination, message dropped"
                );
                false
            }
            Some(handler) => {
                let outcome = AssertUnwindSafe(handler.handle(&delivery, &self.context))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(
                            destination = %delivery.destination,
                            message_id = %delivery.message_id,
                            error = %e,
                            "Handler rejected message"
                        );
                        false
                    }
                    Err(_) => {
                        error!(
                            destination = %delivery.destination,
                            message_id = %delivery.message_id,
                            "Handler panicked"
                        );
                        false
                    }
                }
            }
        };

        if manual && self.take_pending(&delivery.ack_id) {
            self.settle(&delivery, accepted).await;
        }
    }

    async fn acknowledge(&self, delivery: &Delivery, positive: bool) -> bool {
        let ack = self.ack_mode(delivery.subscription).await;
        if !ack.requires_ack() {
            warn!(
                destination = %delivery.destination,
                subscription = delivery.subscription,
                "Explicit acknowledgment on an auto-acknowledged subscription ignored"
            );
            return false;
        }
        if !self.take_pending(&delivery.ack_id) {
            debug!(
                ack_id = %delivery.ack_id,
                subscription = delivery.subscription,
                "Delivery already settled"
            );
            return false;
        }
        self.settle(delivery, positive).await
    }

    async fn settle(&self, delivery: &Delivery, positive: bool) -> bool {
        let (verb, result) = if positive {
            (
                "ACK",
                self.manager
                    .ack(&delivery.ack_id, delivery.subscription)
                    .await,
            )
        } else {
            (
                "NACK",
                self.manager
                    .nack(&delivery.ack_id, delivery.subscription)
                    .await,
            )
        };
        match result {
            Ok(()) => {
                debug!(
                    verb,
                    ack_id = %delivery.ack_id,
                    subscription = delivery.subscription,
                    "Delivery settled"
                );
                true
            }
            Err(e) => {
                warn!(
                    verb,
                    ack_id = %delivery.ack_id,
                    subscription = delivery.subscription,
                    error = %e,
                    "Failed to settle delivery"
                );
                false
            }
        }
    }

    fn take_pending(&self, ack_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ack_id)
            .is_some()
    }

    async fn ack_mode(&self, subscription: u64) -> AckMode {
        let cached = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&subscription)
            .map(|lane| lane.ack);
        match cached {
            Some(ack) => ack,
            None => self
                .manager
                .subscription(subscription)
                .await
                .map_or(AckMode::Auto, |s| s.ack),
        }
    }
}

/// A workflow message decoded from a JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowMessage {
    /// `msg_type` field, `"unknown"` when absent
    pub msg_type: String,
    pub namespace: Option<String>,
    pub data: Value,
}

impl WorkflowMessage {
    /// Decode and filter a delivery.
    ///
    /// Returns `Ok(None)` when both the agent and the message carry a
    /// namespace and they differ. Messages without a namespace, or agents
    /// without one, always pass.
    pub fn parse(
        delivery: &Delivery,
        namespace: Option<&str>,
    ) -> Result<Option<Self>, HandlerError> {
        let data: Value = delivery.json()?;
        let Value::Object(fields) = &data else {
            return Err(HandlerError::malformed(format!(
                "Expected a JSON object on {}",
                delivery.destination
            )));
        };

        let msg_type = fields
            .get("msg_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let msg_namespace = fields
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_owned);

        if let (Some(ours), Some(theirs)) = (namespace, msg_namespace.as_deref())
            && ours != theirs
        {
            debug!(
                msg_type = %msg_type,
                namespace = theirs,
                ours,
                "Ignoring message from another namespace"
            );
            return Ok(None);
        }

        if Self::is_known_type(&msg_type) {
            info!(msg_type = %msg_type, destination = %delivery.destination, "Received message");
        } else {
            info!(
                msg_type = %msg_type,
                destination = %delivery.destination,
                "Received unknown message type"
            );
        }

        Ok(Some(Self {
            msg_type,
            namespace: msg_namespace,
            data,
        }))
    }

    pub fn is_known_type(msg_type: &str) -> bool {
        WORKFLOW_MESSAGE_TYPES.contains(&msg_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(destination: &str, subscription: &str, body: &str) -> Frame {
        Frame::new(swf_stomp::Command::Message)
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::SUBSCRIPTION, subscription)
            .with_header(headers::MESSAGE_ID, "ID:broker-1")
            .with_body(body.to_owned())
    }

    fn delivery(body: serde_json::Value) -> Delivery {
        Delivery::from_frame(frame("/topic/epictopic", "1", &body.to_string())).expect("valid")
    }

    #[test]
    fn ack_id_prefers_ack_header() {
        let d = Delivery::from_frame(frame("/queue/q", "3", "").with_header(headers::ACK, "a-9"))
            .expect("valid");
        assert_eq!(d.ack_id, "a-9");
        assert_eq!(d.message_id, "ID:broker-1");
        assert_eq!(d.subscription, 3);
    }

    #[test]
    fn ack_id_falls_back_to_message_id() {
        let d = Delivery::from_frame(frame("/queue/q", "3", "")).expect("valid");
        assert_eq!(d.ack_id, "ID:broker-1");
    }

    #[test]
    fn frame_without_subscription_is_rejected() {
        let f = Frame::new(swf_stomp::Command::Message)
            .with_header(headers::DESTINATION, "/queue/q")
            .with_header(headers::MESSAGE_ID, "m");
        assert!(Delivery::from_frame(f).is_err());
    }

    #[test]
    fn patterns_match() {
        assert!(DestinationPattern::exact("/queue/a").matches("/queue/a"));
        assert!(!DestinationPattern::exact("/queue/a").matches("/queue/ab"));
        assert!(DestinationPattern::prefix("/queue/").matches("/queue/ab"));
        assert!(!DestinationPattern::prefix("/topic/").matches("/queue/ab"));
    }

    #[test]
    fn workflow_message_type_and_namespace() {
        let msg = WorkflowMessage::parse(
            &delivery(json!({"msg_type": "stf_gen", "namespace": "ns1", "run_id": 7})),
            Some("ns1"),
        )
        .expect("parse")
        .expect("same namespace");
        assert_eq!(msg.msg_type, "stf_gen");
        assert_eq!(msg.data["run_id"], 7);
    }

    #[test]
    fn workflow_message_from_other_namespace_is_filtered() {
        let parsed = WorkflowMessage::parse(
            &delivery(json!({"msg_type": "start_run", "namespace": "other"})),
            Some("ns1"),
        )
        .expect("parse");
        assert!(parsed.is_none());
    }

    #[test]
    fn missing_namespace_on_either_side_passes() {
        let no_msg_ns =
            WorkflowMessage::parse(&delivery(json!({"msg_type": "end_run"})), Some("ns1"))
                .expect("parse");
        assert!(no_msg_ns.is_some());
        let no_agent_ns = WorkflowMessage::parse(
            &delivery(json!({"msg_type": "end_run", "namespace": "x"})),
            None,
        )
        .expect("parse");
        assert!(no_agent_ns.is_some());
    }

    #[test]
    fn missing_msg_type_is_unknown() {
        let msg = WorkflowMessage::parse(&delivery(json!({"x": 1})), None)
            .expect("parse")
            .expect("kept");
        assert_eq!(msg.msg_type, "unknown");
        assert!(!WorkflowMessage::is_known_type(&msg.msg_type));
    }

    #[test]
    fn malformed_json_is_a_handler_error() {
        let d = Delivery::from_frame(frame("/queue/q", "1", "{not json")).expect("valid");
        let err = WorkflowMessage::parse(&d, None).expect_err("malformed");
        assert!(matches!(err, HandlerError::Malformed(_)));
    }

    fn offline_router() -> MessageRouter {
        use crate::connection::ConnectionSettings;
        use swf_common::config::BrokerConfig;
        use swf_stomp::recording::RecordingTransport;

        let (transport, _handle) = RecordingTransport::new();
        let manager = ConnectionManager::new(
            Box::new(transport),
            ConnectionSettings::from_broker(&BrokerConfig::default(), "test-agent-u-1"),
        );
        let sender = OutboundSender::new(
            manager.clone(),
            "test-agent-u-1",
            None,
            std::time::Duration::ZERO,
        );
        MessageRouter::new(
            manager,
            HandlerContext {
                sender,
                stop: StopHandle::new(),
            },
        )
    }

    fn lane_count(router: &MessageRouter) -> usize {
        router
            .core
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[tokio::test]
    async fn removed_subscription_lane_is_released() {
        let router = offline_router();
        router.dispatch(frame("/queue/q", "5", "{}")).await;
        router.dispatch(frame("/queue/r", "6", "{}")).await;
        assert_eq!(lane_count(&router), 2);

        router.close_lane(5);
        assert_eq!(lane_count(&router), 1);
        router.close_lane(5);
        assert_eq!(lane_count(&router), 1);
    }
}
