//! Destination naming and acknowledgment modes
//!
//! Destinations are opaque to the agent beyond their prefix: `/queue/<name>`
//! is point-to-point with competing consumers, `/topic/<name>` is broadcast.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix for point-to-point destinations
pub const QUEUE_PREFIX: &str = "/queue/";

/// Prefix for broadcast destinations
pub const TOPIC_PREFIX: &str = "/topic/";

/// Delivery semantics implied by a destination prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Each message is consumed by exactly one subscriber
    Queue,
    /// Each message is delivered to every active subscriber
    Topic,
}

impl DestinationKind {
    /// Classify a destination by its prefix, or fail with a validation error.
    pub fn of(destination: &str) -> Result<Self> {
        if destination.starts_with(QUEUE_PREFIX) && destination.len() > QUEUE_PREFIX.len() {
            Ok(Self::Queue)
        } else if destination.starts_with(TOPIC_PREFIX) && destination.len() > TOPIC_PREFIX.len()
        {
            Ok(Self::Topic)
        } else {
            Err(BusError::validation(format!(
                "Invalid destination '{destination}': must start with '{QUEUE_PREFIX}' or '{TOPIC_PREFIX}'"
            )))
        }
    }
}

/// Validate a destination string, returning it unchanged on success.
pub fn validate_destination(destination: &str) -> Result<&str> {
    DestinationKind::of(destination)?;
    Ok(destination)
}

/// Build a queue destination from a bare name.
pub fn queue(name: &str) -> String {
    format!("{QUEUE_PREFIX}{}", name.trim_start_matches('/'))
}

/// Build a topic destination from a bare name.
pub fn topic(name: &str) -> String {
    format!("{TOPIC_PREFIX}{}", name.trim_start_matches('/'))
}

/// Acknowledgment mode requested on SUBSCRIBE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// Broker considers a delivery successful as soon as it is sent
    #[default]
    Auto,
    /// Cumulative acknowledgment by the consumer
    Client,
    /// Per-message acknowledgment by the consumer
    ClientIndividual,
}

impl AckMode {
    /// Header value used on the wire
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }

    /// Returns `true` if the consumer must ack or nack each delivery.
    pub const fn requires_ack(self) -> bool {
        matches!(self, Self::Client | Self::ClientIndividual)
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "client" => Ok(Self::Client),
            "client-individual" => Ok(Self::ClientIndividual),
            other => Err(BusError::validation(format!(
                "Unknown ack mode '{other}': expected auto, client or client-individual"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_queue_and_topic() {
        assert_eq!(
            DestinationKind::of("/queue/panda.results").ok(),
            Some(DestinationKind::Queue)
        );
        assert_eq!(
            DestinationKind::of("/topic/epictopic").ok(),
            Some(DestinationKind::Topic)
        );
    }

    #[test]
    fn rejects_missing_or_bare_prefix() {
        for bad in ["invalid_queue", "queue/x", "/queues/x", "/queue/", "/topic/", ""] {
            let err = DestinationKind::of(bad).expect_err("should be rejected");
            assert!(matches!(err, BusError::Validation(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn error_names_both_prefixes() {
        let err = validate_destination("invalid_format").expect_err("rejected");
        assert!(
            err.to_string()
                .contains("must start with '/queue/' or '/topic/'")
        );
    }

    #[test]
    fn builders_normalize_leading_slash() {
        assert_eq!(queue("work"), "/queue/work");
        assert_eq!(topic("/workflow"), "/topic/workflow");
    }

    #[test]
    fn ack_mode_round_trips_wire_names() {
        for mode in [AckMode::Auto, AckMode::Client, AckMode::ClientIndividual] {
            assert_eq!(mode.as_str().parse::<AckMode>().ok(), Some(mode));
        }
        assert!("individual".parse::<AckMode>().is_err());
        assert!(!AckMode::Auto.requires_ack());
        assert!(AckMode::ClientIndividual.requires_ack());
    }
}
