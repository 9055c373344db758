//! The agent run loop.
//!
//! [`Agent`] wires the connection manager, router, sender and status
//! reporter together and drives the lifecycle: subscribe, connect, register,
//! then a periodic liveness check until Ctrl-C or a stop request, followed
//! by an orderly shutdown.

use crate::connection::{ConnectionListener, ConnectionManager, ConnectionSettings};
use crate::error::{AgentError, HandlerError, Result};
use crate::registry::SubscriptionSpec;
use crate::router::{
    Delivery, DestinationPattern, HandlerContext, MessageHandler, MessageRouter, WorkflowMessage,
};
use crate::sender::OutboundSender;
use crate::status::{AgentIdentity, OperationalState, StatusReporter};
use async_trait::async_trait;
use std::sync::Arc;
use swf_common::{AgentConfig, MonitorApi};
use swf_stomp::Transport;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Control message type asking the agent to finish
pub const SOFT_END: &str = "soft_end";

/// Shared stop flag. Any clone can request the run loop to end.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as self, so this only returns on a stop
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

struct DisconnectNotifier(Arc<Notify>);

impl ConnectionListener for DisconnectNotifier {
    fn on_disconnected(&self) {
        self.0.notify_one();
    }
}

/// A messaging agent bound to one broker connection.
pub struct Agent {
    config: AgentConfig,
    identity: Arc<AgentIdentity>,
    manager: ConnectionManager,
    router: MessageRouter,
    sender: OutboundSender,
    status: StatusReporter,
    stop: StopHandle,
    disconnected: Arc<Notify>,
}

impl Agent {
    /// Resolve the agent identity through `monitor` and assemble the core.
    pub async fn new(
        config: AgentConfig,
        transport: Box<dyn Transport>,
        monitor: Arc<dyn MonitorApi>,
        namespace: Option<String>,
    ) -> Result<Self> {
        let identity = Arc::new(
            AgentIdentity::resolve(&config.agent.agent_type, namespace, monitor.as_ref()).await?,
        );
        let manager = ConnectionManager::new(
            transport,
            ConnectionSettings::from_broker(&config.broker, &identity.agent_name),
        );
        let disconnected = Arc::new(Notify::new());
        manager.add_listener(Arc::new(DisconnectNotifier(Arc::clone(&disconnected))));

        let sender = OutboundSender::new(
            manager.clone(),
            identity.agent_name.as_str(),
            identity.namespace.clone(),
            config.broker.send_retry_pause(),
        );
        let stop = StopHandle::new();
        let router = MessageRouter::new(
            manager.clone(),
            HandlerContext {
                sender: sender.clone(),
                stop: stop.clone(),
            },
        );
        let status = StatusReporter::new(Arc::clone(&identity), manager.clone(), monitor);

        Ok(Self {
            config,
            identity,
            manager,
            router,
            sender,
            status,
            stop,
            disconnected,
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn sender(&self) -> &OutboundSender {
        &self.sender
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Route `pattern` to `handler`. The agent reports PROCESSING while the
    /// handler runs.
    pub fn route(&self, pattern: DestinationPattern, handler: Arc<dyn MessageHandler>) {
        let tracked = Tracked {
            inner: handler,
            status: self.status.clone(),
        };
        self.router.route(pattern, Arc::new(tracked));
    }

    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<u64> {
        self.manager.add_subscription(spec).await
    }

    pub async fn unsubscribe(&self, destination: &str) -> bool {
        let id = self.manager.subscription_for(destination).await.map(|s| s.id);
        let removed = self.manager.remove_subscription(destination).await;
        if removed && let Some(id) = id {
            self.router.close_lane(id);
        }
        removed
    }

    /// Run until Ctrl-C or a stop request.
    ///
    /// Failing to connect at startup or to register with the monitor ends
    /// the run with an error before the agent ever reports READY.
    pub async fn run(&self) -> Result<()> {
        info!(agent = %self.identity.agent_name, "Starting agent");

        for subscription in &self.config.agent.subscriptions {
            self.manager
                .add_subscription(SubscriptionSpec::from(subscription))
                .await?;
        }

        let deliveries = self
            .manager
            .take_delivery_receiver()
            .ok_or_else(|| AgentError::validation("Agent is already running"))?;
        let router_task = self.router.clone().spawn(deliveries);

        if let Err(e) = self.manager.connect().await {
            error!(error = %e, "Could not connect to broker");
            self.abandon(router_task, "Failed to connect to broker", &e)
                .await;
            return Err(e);
        }

        let destinations = self.manager.subscriptions().await;
        if let Err(e) = self.status.register_subscribers(&destinations).await {
            error!(error = %e, "Subscriber registration failed");
            self.abandon(router_task, "Subscriber registration failed", &e)
                .await;
            if let Err(disconnect) = self.manager.disconnect().await {
                warn!(error = %disconnect, "Disconnect after failed registration");
            }
            return Err(e);
        }

        self.status.set_operational_state(OperationalState::Ready);
        self.status.heartbeat().await;
        info!(agent = %self.identity.agent_name, "Agent is running");

        let mut ticker = tokio::time::interval(self.config.runtime.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                biased;
                result = &mut ctrl_c => {
                    if let Err(e) = result {
                        warn!(error = %e, "Signal handler failed");
                    }
                    info!("Interrupt received, stopping");
                    break;
                }
                () = self.stop.wait() => {
                    info!("Stop requested");
                    break;
                }
                () = self.disconnected.notified() => {
                    self.status.heartbeat().await;
                }
                _ = ticker.tick() => {
                    self.liveness_check().await;
                }
            }
        }

        self.shutdown(router_task).await;
        Ok(())
    }

    /// Reconnect if needed, then heartbeat. Failures wait for the next tick.
    async fn liveness_check(&self) {
        if !self.manager.is_connected() {
            warn!("Broker connection is down, attempting to reconnect");
            if let Err(e) = self.manager.reconnect().await {
                warn!(error = %e, "Reconnect failed, will retry on next check");
            }
        }
        self.status.heartbeat().await;
    }

    async fn abandon(&self, router_task: JoinHandle<()>, message: &str, cause: &AgentError) {
        router_task.abort();
        self.status.set_operational_state(OperationalState::Exited);
        self.status
            .report_status("EXITED", Some(message), Some(&cause.to_string()))
            .await;
    }

    async fn shutdown(&self, router_task: JoinHandle<()>) {
        info!(agent = %self.identity.agent_name, "Stopping agent");
        self.status.set_operational_state(OperationalState::Exited);
        if !self
            .status
            .report_status("EXITED", Some("Agent shutdown"), None)
            .await
        {
            warn!("Failed to report exit status");
        }
        if let Err(e) = self.manager.disconnect().await {
            warn!(error = %e, "Error while disconnecting");
        }
        router_task.abort();
        info!("Agent stopped");
    }
}

/// Holds the agent in PROCESSING for the duration of each delivery.
struct Tracked {
    inner: Arc<dyn MessageHandler>,
    status: StatusReporter,
}

#[async_trait]
impl MessageHandler for Tracked {
    async fn handle(
        &self,
        delivery: &Delivery,
        ctx: &HandlerContext,
    ) -> std::result::Result<(), HandlerError> {
        let _busy = self.status.begin_processing();
        self.inner.handle(delivery, ctx).await
    }
}

/// Logs every workflow message and honors [`SOFT_END`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowLogger;

#[async_trait]
impl MessageHandler for WorkflowLogger {
    async fn handle(
        &self,
        delivery: &Delivery,
        ctx: &HandlerContext,
    ) -> std::result::Result<(), HandlerError> {
        let Some(message) = WorkflowMessage::parse(delivery, ctx.namespace())? else {
            return Ok(());
        };
        if message.msg_type == SOFT_END {
            info!(destination = %delivery.destination, "Soft end requested");
            ctx.stop.request_stop();
        }
        Ok(())
    }
}
