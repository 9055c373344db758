//! Subscription registry for the broker connection.
//!
//! The registry is pure bookkeeping: it validates requests, assigns ids and
//! remembers every subscription in insertion order so the connection manager
//! can replay them after a reconnect. Ids start at 1, increase monotonically
//! and are never reused, even after removal.

use swf_common::config::SubscriptionConfig;
use swf_stomp::{AckMode, BusError, SubscribeRequest, Transport, validate_destination};
use tracing::{info, warn};

/// Requested subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub destination: String,
    pub ack: AckMode,
    pub prefetch: u32,
    pub selector: Option<String>,
}

impl SubscriptionSpec {
    /// Auto-acked subscription with prefetch 1.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ack: AckMode::Auto,
            prefetch: 1,
            selector: None,
        }
    }

    #[must_use]
    pub const fn ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    #[must_use]
    pub const fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    #[must_use]
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Reject malformed requests before anything touches the network.
    pub fn validate(&self) -> Result<(), BusError> {
        validate_destination(&self.destination)?;
        if self.prefetch == 0 {
            return Err(BusError::validation(format!(
                "Invalid prefetch for '{}': must be greater than 0",
                self.destination
            )));
        }
        Ok(())
    }
}

impl From<&SubscriptionConfig> for SubscriptionSpec {
    fn from(config: &SubscriptionConfig) -> Self {
        Self {
            destination: config.destination.clone(),
            ack: config.ack,
            prefetch: config.prefetch,
            selector: config.selector.clone(),
        }
    }
}

/// A registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub destination: String,
    pub ack: AckMode,
    pub prefetch: u32,
    pub selector: Option<String>,
}

impl Subscription {
    /// SUBSCRIBE parameters for this entry
    pub fn request(&self) -> SubscribeRequest {
        SubscribeRequest {
            id: self.id,
            destination: self.destination.clone(),
            ack: self.ack,
            prefetch: self.prefetch,
            selector: self.selector.clone(),
        }
    }
}

/// In-memory subscription registry.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
    next_id: u64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Record a subscription.
    ///
    /// Returns the entry and whether it was newly created. Adding a
    /// destination that is already present returns the existing entry
    /// untouched.
    pub fn add(&mut self, spec: SubscriptionSpec) -> Result<(Subscription, bool), BusError> {
        spec.validate()?;
        if let Some(existing) = self.find(&spec.destination) {
            return Ok((existing.clone(), false));
        }

        let subscription = Subscription {
            id: self.next_id,
            destination: spec.destination,
            ack: spec.ack,
            prefetch: spec.prefetch,
            selector: spec.selector,
        };
        self.next_id = self.next_id.saturating_add(1);
        self.entries.push(subscription.clone());
        Ok((subscription, true))
    }

    /// Forget the subscription for `destination`, returning it if present.
    pub fn remove(&mut self, destination: &str) -> Option<Subscription> {
        let index = self
            .entries
            .iter()
            .position(|s| s.destination == destination)?;
        Some(self.entries.remove(index))
    }

    /// Destinations in insertion order
    pub fn list(&self) -> Vec<String> {
        self.entries.iter().map(|s| s.destination.clone()).collect()
    }

    pub fn get(&self, id: u64) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.id == id)
    }

    pub fn find(&self, destination: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.destination == destination)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Issue SUBSCRIBE for every entry in insertion order with its original id.
    ///
    /// A failure on one entry is logged and does not stop the rest. Returns
    /// the number of subscriptions restored.
    pub async fn replay(&self, transport: &mut dyn Transport) -> usize {
        let mut restored = 0_usize;
        for subscription in &self.entries {
            match transport.subscribe(&subscription.request()).await {
                Ok(()) => {
                    restored = restored.saturating_add(1);
                    info!(
                        id = subscription.id,
                        destination = %subscription.destination,
                        ack = %subscription.ack,
                        "Subscription restored"
                    );
                }
                Err(e) => {
                    warn!(
                        id = subscription.id,
                        destination = %subscription.destination,
                        error = %e,
                        "Failed to restore subscription"
                    );
                }
            }
        }
        restored
    }
}
