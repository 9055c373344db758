//! Broker connection management.
//!
//! [`ConnectionManager`] owns the single transport and the subscription
//! registry behind one async mutex, so subscription changes, sends,
//! acknowledgments and reconnects never interleave. A background pump task
//! drains the transport's session-tagged events: it keeps the observable
//! [`ConnectionState`] current, notifies [`ConnectionListener`]s and forwards
//! MESSAGE frames to the delivery consumer. Events stamped with an older
//! session number are ignored.

use crate::error::{AgentError, Result};
use crate::registry::{Subscription, SubscriptionRegistry, SubscriptionSpec};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use swf_common::config::BrokerConfig;
use swf_stomp::frame::headers;
use swf_stomp::{
    BusError, ConnectParams, EventSink, Frame, SessionEvent, Transport, TransportEvent,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DELIVERY_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Callbacks for connection lifecycle and inbound traffic.
///
/// Called from the event pump; implementations must not block.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, _headers: &[(String, String)]) {}

    fn on_error(&self, _frame: &Frame) {}

    fn on_disconnected(&self) {}

    fn on_message(&self, _frame: &Frame) {}
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Successful connects, initial and reconnects
    pub connects: u64,
    /// Reconnection attempts after startup
    pub reconnect_attempts: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    /// Last event received on the current session
    pub last_activity: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    pub acks: u64,
    pub nacks: u64,
    pub active_subscriptions: usize,
}

/// Connection parameters plus startup retry policy
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub params: ConnectParams,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
}

impl ConnectionSettings {
    pub fn from_broker(broker: &BrokerConfig, client_id: &str) -> Self {
        Self {
            params: broker.connect_params(client_id),
            connect_attempts: broker.connect_attempts,
            retry_delay: broker.retry_delay(),
        }
    }
}

struct Link {
    transport: Box<dyn Transport>,
    registry: SubscriptionRegistry,
}

struct Inner {
    settings: ConnectionSettings,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    session: AtomicU64,
    stats: StdMutex<ConnectionStats>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<SessionEvent>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    deliveries_tx: StdMutex<Option<mpsc::Sender<Frame>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

/// Owner of the broker connection. Cloning yields another handle to the
/// same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn Transport>, settings: ConnectionSettings) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                settings,
                link: Mutex::new(Link {
                    transport,
                    registry: SubscriptionRegistry::new(),
                }),
                state,
                session: AtomicU64::new(0),
                stats: StdMutex::new(ConnectionStats::default()),
                listeners: RwLock::new(Vec::new()),
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                pump: StdMutex::new(None),
                deliveries_tx: StdMutex::new(None),
            }),
        }
    }

    /// Broker address for logs
    pub fn address(&self) -> String {
        self.inner.settings.params.address()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state change
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection is up. Returns `false` on timeout.
    pub async fn wait_for_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state_watch();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected))
                .await,
            Ok(Ok(_))
        )
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Take the receiver of inbound MESSAGE frames.
    ///
    /// Messages arriving before the receiver is taken are dropped. Returns
    /// `None` after the first call.
    pub fn take_delivery_receiver(&self) -> Option<mpsc::Receiver<Frame>> {
        let mut slot = self
            .inner
            .deliveries_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        *slot = Some(tx);
        Some(rx)
    }

    /// Connect with the startup retry policy.
    ///
    /// Exhausting every attempt is fatal and returns
    /// [`AgentError::ConnectFailed`].
    pub async fn connect(&self) -> Result<()> {
        self.ensure_pump();
        let attempts = self.inner.settings.connect_attempts.max(1);
        let address = self.address();
        let mut last_error = None;

        for attempt in 1..=attempts {
            info!(
                address = %address,
                attempt,
                max_attempts = attempts,
                "Connecting to broker"
            );
            let result = {
                let mut link = self.inner.link.lock().await;
                self.establish(&mut link).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        info!(delay = ?self.inner.settings.retry_delay, "Retrying");
                        tokio::time::sleep(self.inner.settings.retry_delay).await;
                    }
                }
            }
        }

        error!(address = %address, attempts, "Failed to connect to broker");
        Err(AgentError::ConnectFailed {
            attempts,
            last_error: last_error.unwrap_or(BusError::NotConnected),
        })
    }

    /// Re-establish the connection and replay every subscription.
    ///
    /// A no-op returning `Ok(false)` when already connected; otherwise makes
    /// a single attempt and returns `Ok(true)` on success.
    pub async fn reconnect(&self) -> Result<bool> {
        self.ensure_pump();
        let mut link = self.inner.link.lock().await;
        if self.is_connected() && link.transport.is_connected() {
            debug!("Reconnect requested while connected");
            return Ok(false);
        }

        self.update_stats(|s| s.reconnect_attempts = s.reconnect_attempts.saturating_add(1));
        info!(address = %self.address(), "Attempting to reconnect to broker");
        match self.establish(&mut link).await {
            Ok(()) => {
                info!("Reconnected to broker");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Reconnection attempt failed");
                Err(e.into())
            }
        }
    }

    /// Tear down the connection. Succeeds when already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let mut link = self.inner.link.lock().await;
        // events still in flight from this session are now stale
        self.inner.session.fetch_add(1, Ordering::SeqCst);
        let result = if link.transport.is_connected() {
            link.transport.disconnect().await
        } else {
            Ok(())
        };
        self.set_state(ConnectionState::Disconnected);
        match result {
            Ok(()) => {
                info!("Disconnected from broker");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Error while disconnecting");
                Err(e.into())
            }
        }
    }

    /// Record that the connection is known to be lost.
    pub fn mark_disconnected(&self, reason: &str) {
        if self.state() != ConnectionState::Disconnected {
            warn!(reason, "Marking broker connection as lost");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Register a subscription, issuing SUBSCRIBE right away when connected.
    ///
    /// Invalid requests fail before any transport call. Adding a destination
    /// that is already registered returns its existing id. If SUBSCRIBE fails
    /// because the connection is gone, the entry stays registered, the
    /// connection is marked lost and the next reconnect restores it. Any
    /// other SUBSCRIBE failure unregisters the entry and is returned.
    pub async fn add_subscription(&self, spec: SubscriptionSpec) -> Result<u64> {
        spec.validate()?;
        let mut link = self.inner.link.lock().await;
        let (subscription, created) = link.registry.add(spec)?;
        if !created {
            debug!(
                id = subscription.id,
                destination = %subscription.destination,
                "Already subscribed"
            );
            return Ok(subscription.id);
        }

        if self.is_connected() {
            match link.transport.subscribe(&subscription.request()).await {
                Ok(()) => info!(
                    id = subscription.id,
                    destination = %subscription.destination,
                    ack = %subscription.ack,
                    prefetch = subscription.prefetch,
                    "Subscribed"
                ),
                Err(e) if e.is_connection_loss() => {
                    warn!(
                        id = subscription.id,
                        destination = %subscription.destination,
                        error = %e,
                        "SUBSCRIBE failed, will retry on reconnect"
                    );
                    self.mark_disconnected("SUBSCRIBE failed on a lost connection");
                }
                Err(e) => {
                    link.registry.remove(&subscription.destination);
                    warn!(
                        id = subscription.id,
                        destination = %subscription.destination,
                        error = %e,
                        "SUBSCRIBE refused by broker"
                    );
                    return Err(e.into());
                }
            }
        } else {
            info!(
                id = subscription.id,
                destination = %subscription.destination,
                "Subscription recorded, will subscribe once connected"
            );
        }
        let count = link.registry.len();
        self.update_stats(|s| s.active_subscriptions = count);
        Ok(subscription.id)
    }

    /// Remove the subscription for `destination`.
    ///
    /// Returns `false` if it was not registered. When connected, UNSUBSCRIBE
    /// is sent with the tracked id; a failure there is logged and the entry
    /// is removed regardless.
    pub async fn remove_subscription(&self, destination: &str) -> bool {
        let mut link = self.inner.link.lock().await;
        let Some(id) = link.registry.find(destination).map(|s| s.id) else {
            debug!(destination, "Not subscribed");
            return false;
        };

        if self.is_connected()
            && let Err(e) = link.transport.unsubscribe(id).await
        {
            warn!(id, destination, error = %e, "UNSUBSCRIBE failed");
        }
        link.registry.remove(destination);
        let count = link.registry.len();
        self.update_stats(|s| s.active_subscriptions = count);
        info!(id, destination, "Unsubscribed");
        true
    }

    /// Registered destinations in insertion order
    pub async fn subscriptions(&self) -> Vec<String> {
        self.inner.link.lock().await.registry.list()
    }

    pub async fn subscription(&self, id: u64) -> Option<Subscription> {
        self.inner.link.lock().await.registry.get(id).cloned()
    }

    pub async fn subscription_for(&self, destination: &str) -> Option<Subscription> {
        self.inner
            .link
            .lock()
            .await
            .registry
            .find(destination)
            .cloned()
    }

    /// Send one SEND frame on the current session.
    pub async fn send_frame(
        &self,
        destination: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> std::result::Result<(), BusError> {
        let result = {
            let mut link = self.inner.link.lock().await;
            link.transport.send(destination, body, headers).await
        };
        match result {
            Ok(()) => self.update_stats(|s| s.messages_sent = s.messages_sent.saturating_add(1)),
            Err(_) => self.update_stats(|s| s.send_failures = s.send_failures.saturating_add(1)),
        }
        result
    }

    pub async fn ack(&self, ack_id: &str, subscription: u64) -> std::result::Result<(), BusError> {
        let result = {
            let mut link = self.inner.link.lock().await;
            link.transport.ack(ack_id, subscription).await
        };
        if result.is_ok() {
            self.update_stats(|s| s.acks = s.acks.saturating_add(1));
        }
        result
    }

    pub async fn nack(&self, ack_id: &str, subscription: u64) -> std::result::Result<(), BusError> {
        let result = {
            let mut link = self.inner.link.lock().await;
            link.transport.nack(ack_id, subscription).await
        };
        if result.is_ok() {
            self.update_stats(|s| s.nacks = s.nacks.saturating_add(1));
        }
        result
    }

    /// One connection attempt on a locked link, followed by replay.
    async fn establish(&self, link: &mut Link) -> std::result::Result<(), BusError> {
        self.set_state(ConnectionState::Connecting);
        if link.transport.is_connected()
            && let Err(e) = link.transport.disconnect().await
        {
            debug!(error = %e, "Stale connection teardown failed");
        }

        let session = self
            .inner
            .session
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        let sink = EventSink::new(session, self.inner.events_tx.clone());
        if let Err(e) = link
            .transport
            .connect(&self.inner.settings.params, sink)
            .await
        {
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let restored = link.registry.replay(link.transport.as_mut()).await;
        if restored < link.registry.len() {
            warn!(
                restored,
                total = link.registry.len(),
                "Some subscriptions were not restored"
            );
        }

        if link.transport.is_connected() {
            self.set_state(ConnectionState::Connected);
            let count = link.registry.len();
            self.update_stats(|s| {
                s.connects = s.connects.saturating_add(1);
                s.last_connected = Some(Utc::now());
                s.active_subscriptions = count;
            });
            info!(session, subscriptions = restored, "Broker session ready");
            Ok(())
        } else {
            self.set_state(ConnectionState::Disconnected);
            Err(BusError::transport(
                "Connection lost while restoring subscriptions",
            ))
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(state = ?state, "Connection state changed");
            if state == ConnectionState::Disconnected {
                self.update_stats(|s| s.last_disconnected = Some(Utc::now()));
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ConnectionStats)) {
        f(&mut self
            .inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner));
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_pump(&self) {
        let Some(rx) = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(pump_events(weak, rx));
        *self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn handle_event(&self, event: SessionEvent) {
        let current = self.inner.session.load(Ordering::SeqCst);
        if event.session != current {
            debug!(
                session = event.session,
                current, "Ignoring event from superseded session"
            );
            return;
        }
        self.update_stats(|s| s.last_activity = Some(Utc::now()));

        match event.event {
            TransportEvent::Connected(headers) => {
                // Connected is published by establish once subscriptions are replayed
                info!(headers = ?headers, "Connected to broker");
                for listener in self.listeners() {
                    listener.on_connected(&headers);
                }
            }
            TransportEvent::Error(frame) => {
                error!(
                    message = frame.header(headers::MESSAGE).unwrap_or_default(),
                    body = %frame.body_text(),
                    "Broker reported an error"
                );
                self.set_state(ConnectionState::Disconnected);
                for listener in self.listeners() {
                    listener.on_error(&frame);
                }
            }
            TransportEvent::Disconnected => {
                warn!("Disconnected from broker, will attempt reconnection");
                self.set_state(ConnectionState::Disconnected);
                for listener in self.listeners() {
                    listener.on_disconnected();
                }
            }
            TransportEvent::Message(frame) => {
                self.update_stats(|s| s.messages_received = s.messages_received.saturating_add(1));
                for listener in self.listeners() {
                    listener.on_message(&frame);
                }
                self.forward_delivery(frame).await;
            }
            TransportEvent::Receipt(id) => trace!(receipt = %id, "Receipt"),
            other => debug!(event = ?other, "Unhandled transport event"),
        }
    }

    async fn forward_delivery(&self, frame: Frame) {
        let tx = self
            .inner
            .deliveries_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) => {
                if tx.send(frame).await.is_err() {
                    warn!("Delivery consumer has gone away, message dropped");
                }
            }
            None => debug!(
                destination = frame.header(headers::DESTINATION).unwrap_or_default(),
                "No delivery consumer attached, message dropped"
            ),
        }
    }
}

async fn pump_events(inner: Weak<Inner>, mut rx: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ConnectionManager { inner }.handle_event(event).await;
    }
    trace!("Event pump stopped");
}
