#![forbid(unsafe_code)]

//! swf-common: shared functionality for SWF testbed agents.
//!
//! - Configuration management with hierarchical overrides
//! - Testbed namespace loading
//! - Process-wide logging initialization
//! - Monitor REST API client

pub mod config;
pub mod monitor;
pub mod telemetry;

pub use config::{AgentConfig, ConfigError, ConfigLoader, TestbedConfig};
pub use monitor::{MonitorApi, MonitorError};
