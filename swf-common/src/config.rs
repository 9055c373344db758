//! Configuration management with hierarchical overrides using figment.
//!
//! Sources in increasing precedence:
//! 1. Embedded defaults
//! 2. System configuration file (`/etc/swf/agent.toml`)
//! 3. User configuration file (`~/.config/swf/agent.toml`)
//! 4. Explicit configuration file passed by the caller
//! 5. Prefixed environment variables (`SWF_AGENT_BROKER__HOST=...`)
//! 6. Deployment environment variables (`ACTIVEMQ_HOST`, `SWF_MONITOR_URL`, ...)
//!
//! The testbed namespace lives in a separate `testbed.toml` and is loaded
//! strictly through [`TestbedConfig::load`].

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use swf_stomp::{AckMode, ConnectParams, HeartBeat, TlsSettings};
use thiserror::Error;

/// Deployment variable names and the configuration keys they populate
pub const LEGACY_ENV_KEYS: [(&str, &str); 11] = [
    ("ACTIVEMQ_HOST", "broker.host"),
    ("ACTIVEMQ_PORT", "broker.port"),
    ("ACTIVEMQ_USER", "broker.user"),
    ("ACTIVEMQ_PASSWORD", "broker.password"),
    ("ACTIVEMQ_USE_SSL", "broker.use_ssl"),
    ("ACTIVEMQ_SSL_CA_CERTS", "broker.ssl_ca_certs"),
    ("SWF_MONITOR_URL", "monitor.url"),
    ("SWF_API_TOKEN", "monitor.api_token"),
    ("SWF_LOG_LEVEL", "logging.level"),
    ("SWF_AGENT_QUIET", "logging.quiet"),
    ("SWF_STOMP_DEBUG", "logging.broker_debug"),
];

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] figment::Error),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },

    #[error("Testbed configuration error: {message}")]
    Testbed { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    fn testbed(message: impl Into<String>) -> Self {
        Self::Testbed {
            message: message.into(),
        }
    }
}

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AgentConfig {
    /// Agent identity and subscriptions
    pub agent: AgentSettings,
    /// Message broker connection
    pub broker: BrokerConfig,
    /// Monitor REST API
    pub monitor: MonitorConfig,
    /// Logging setup
    pub logging: LoggingConfig,
    /// Run loop timing
    pub runtime: RuntimeConfig,
}

/// Agent identity and the subscriptions it establishes at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSettings {
    /// Agent type, e.g. `DATA` or `PROCESSING`
    pub agent_type: String,
    /// Destinations subscribed before the run loop starts
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Path to `testbed.toml` holding the namespace
    #[serde(default)]
    pub testbed_config: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_type: "GENERIC".to_owned(),
            subscriptions: Vec::new(),
            testbed_config: None,
        }
    }
}

/// One configured subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub destination: String,
    #[serde(default)]
    pub ack: AckMode,
    #[serde(default = "default_prefetch")]
    pub prefetch: u32,
    #[serde(default)]
    pub selector: Option<String>,
}

impl SubscriptionConfig {
    /// Auto-acked subscription with prefetch 1
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ack: AckMode::Auto,
            prefetch: default_prefetch(),
            selector: None,
        }
    }
}

const fn default_prefetch() -> u32 {
    1
}

/// Broker connection settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Virtual host for CONNECT; defaults to `host`
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub user: String,
    #[serde(deserialize_with = "lenient_string")]
    pub password: String,
    /// Heart-beat this side promises to send, in milliseconds
    pub heartbeat_send_ms: u64,
    /// Heart-beat this side expects from the broker, in milliseconds
    pub heartbeat_receive_ms: u64,
    /// Connection attempts at startup before giving up
    pub connect_attempts: u32,
    /// Pause between startup connection attempts
    pub retry_delay_secs: u64,
    /// Bound on TCP connect plus the STOMP handshake
    pub connect_timeout_secs: u64,
    /// Pause before reconnecting after a failed send
    pub send_retry_pause_ms: u64,
    /// Connect over TLS
    #[serde(default)]
    pub use_ssl: bool,
    /// PEM bundle of trusted CAs for TLS; platform roots when unset
    #[serde(default, deserialize_with = "lenient_opt_path")]
    pub ssl_ca_certs: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 61612,
            vhost: None,
            user: "admin".to_owned(),
            password: "admin".to_owned(),
            heartbeat_send_ms: 30_000,
            heartbeat_receive_ms: 30_000,
            connect_attempts: 3,
            retry_delay_secs: 5,
            connect_timeout_secs: 10,
            send_retry_pause_ms: 1_000,
            use_ssl: false,
            ssl_ca_certs: None,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("heartbeat_send_ms", &self.heartbeat_send_ms)
            .field("heartbeat_receive_ms", &self.heartbeat_receive_ms)
            .field("connect_attempts", &self.connect_attempts)
            .field("retry_delay_secs", &self.retry_delay_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("send_retry_pause_ms", &self.send_retry_pause_ms)
            .field("use_ssl", &self.use_ssl)
            .field("ssl_ca_certs", &self.ssl_ca_certs)
            .finish()
    }
}

impl BrokerConfig {
    pub fn vhost(&self) -> &str {
        self.vhost.as_deref().unwrap_or(&self.host)
    }

    pub const fn heart_beat(&self) -> HeartBeat {
        HeartBeat::new(self.heartbeat_send_ms, self.heartbeat_receive_ms)
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub const fn send_retry_pause(&self) -> Duration {
        Duration::from_millis(self.send_retry_pause_ms)
    }

    /// Transport parameters for a session identified by `client_id`
    pub fn connect_params(&self, client_id: &str) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost().to_owned(),
            login: self.user.clone(),
            passcode: self.password.clone(),
            client_id: client_id.to_owned(),
            heart_beat: self.heart_beat(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            tls: self.use_ssl.then(|| TlsSettings {
                ca_certs: self.ssl_ca_certs.clone(),
            }),
        }
    }
}

/// Monitor REST API settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Authenticated API base URL; no monitor when unset
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub api_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_token: None,
            timeout_secs: 10,
        }
    }
}

impl fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("url", &self.url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl MonitorConfig {
    /// Monitor base URL without trailing slashes; `None` when unset or blank
    pub fn base_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty())
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoggingConfig {
    /// Explicit level; falls back to `warn` when quiet, else `info`
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default, deserialize_with = "flag")]
    pub quiet: bool,
    /// Let wire-level STOMP logging through at the configured level
    #[serde(default, deserialize_with = "flag")]
    pub broker_debug: bool,
}

impl LoggingConfig {
    pub fn effective_level(&self) -> &str {
        match self.level.as_deref().map(str::trim) {
            Some(level) if !level.is_empty() => level,
            _ if self.quiet => "warn",
            _ => "info",
        }
    }
}

/// Run loop timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Seconds between liveness checks and heartbeats
    pub poll_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

impl RuntimeConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Accepts `true/false`, `1/0`, `yes/no` and `on/off`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => b,
        Raw::Int(i) => i != 0,
        Raw::Text(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Int(i) => i.to_string(),
            Self::UInt(u) => u.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

/// Environment values that look numeric still name strings here.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Scalar::deserialize(deserializer).map(Scalar::into_string)
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_string))
}

/// An empty value means no path.
fn lenient_opt_path<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<PathBuf>, D::Error> {
    Ok(lenient_opt_string(deserializer)?
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from))
}

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
    config_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a loader for `component` (e.g. `swf-agent`).
    ///
    /// The component name determines the environment prefix (`SWF_AGENT_`)
    /// and the file stem (`agent.toml`).
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            config_file: None,
        }
    }

    /// Layer an explicit configuration file above the system and user files.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    fn file_name(&self) -> String {
        format!(
            "{}.toml",
            self.component.strip_prefix("swf-").unwrap_or(&self.component)
        )
    }

    fn env_prefix(&self) -> String {
        format!("{}_", self.component.replace('-', "_").to_uppercase())
    }

    /// Load and validate the configuration.
    pub fn load(&self) -> Result<AgentConfig, ConfigError> {
        let config: AgentConfig = self.figment()?.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Assemble the provider stack without extracting it.
    pub fn figment(&self) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));

        let system_config_path = Path::new("/etc/swf").join(self.file_name());
        if system_config_path.exists() {
            figment = figment.merge(Toml::file(&system_config_path));
        }

        if let Some(user_config_path) = self.user_config_path()
            && user_config_path.exists()
        {
            figment = figment.merge(Toml::file(&user_config_path));
        }

        if let Some(ref path) = self.config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() });
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment
            .merge(Env::prefixed(&self.env_prefix()).split("__"))
            .merge(legacy_env());
        Ok(figment)
    }

    fn user_config_path(&self) -> Option<PathBuf> {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .map(|dir| dir.join("swf").join(self.file_name()))
    }
}

/// Provider for the deployment variable names in [`LEGACY_ENV_KEYS`].
fn legacy_env() -> Env {
    Env::raw().filter_map(|key| {
        LEGACY_ENV_KEYS
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, target)| (*target).into())
    })
}

impl AgentConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.agent_type.trim().is_empty() {
            return Err(ConfigError::invalid("agent_type must not be empty"));
        }
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::invalid("broker host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::invalid("broker port must be greater than 0"));
        }
        if self.broker.user.is_empty() || self.broker.password.is_empty() {
            return Err(ConfigError::invalid("broker credentials must be set"));
        }
        if self.broker.use_ssl
            && let Some(path) = &self.broker.ssl_ca_certs
            && !path.is_file()
        {
            return Err(ConfigError::invalid(format!(
                "SSL CA certificate file not found: {}",
                path.display()
            )));
        }
        if self.broker.connect_attempts == 0 {
            return Err(ConfigError::invalid(
                "connect_attempts must be greater than 0",
            ));
        }
        if self.runtime.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "poll_interval_secs must be greater than 0",
            ));
        }
        for sub in &self.agent.subscriptions {
            swf_stomp::validate_destination(&sub.destination)
                .map_err(|e| ConfigError::invalid(e.to_string()))?;
            if sub.prefetch == 0 {
                return Err(ConfigError::invalid(format!(
                    "prefetch for {} must be greater than 0",
                    sub.destination
                )));
            }
        }
        Ok(())
    }
}

/// Testbed instance settings from `testbed.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestbedConfig {
    pub namespace: String,
}

#[derive(Deserialize)]
struct TestbedFile {
    testbed: Option<TestbedSection>,
}

#[derive(Deserialize)]
struct TestbedSection {
    namespace: Option<String>,
}

impl TestbedConfig {
    /// Load the namespace, failing on anything short of a non-empty value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display();
        if !path.exists() {
            return Err(ConfigError::testbed(format!(
                "Testbed config not found: {shown}. Create testbed.toml with a [testbed] section and a namespace setting"
            )));
        }

        let file: TestbedFile = Figment::from(Toml::file(path))
            .extract()
            .map_err(|e| ConfigError::testbed(format!("Invalid TOML in {shown}: {e}")))?;

        let section = file
            .testbed
            .ok_or_else(|| ConfigError::testbed(format!("Missing [testbed] section in {shown}")))?;
        let namespace = section.namespace.ok_or_else(|| {
            ConfigError::testbed(format!(
                "Missing 'namespace' in [testbed] section of {shown}"
            ))
        })?;
        if namespace.is_empty() {
            return Err(ConfigError::testbed(format!(
                "Namespace not configured in {shown}. Set namespace to your testbed instance name, e.g. 'epic-fastmon-dev'"
            )));
        }
        Ok(Self { namespace })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;

    /// Point the user config lookup into the jail
    fn isolate(jail: &mut Jail) {
        let dir = jail.directory().to_path_buf();
        jail.set_env("XDG_CONFIG_HOME", dir.display());
    }

    #[test]
    fn defaults_match_deployment_expectations() {
        let config = AgentConfig::default();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 61612);
        assert_eq!(config.broker.vhost(), "localhost");
        assert_eq!(config.broker.heart_beat(), HeartBeat::new(30_000, 30_000));
        assert_eq!(config.broker.connect_attempts, 3);
        assert_eq!(config.broker.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.runtime.poll_interval(), Duration::from_secs(60));
        assert!(config.monitor.base_url().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loader_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            isolate(jail);
            let config = ConfigLoader::new("swf-agent").load().expect("defaults load");
            assert_eq!(config.broker.port, 61612);
            assert_eq!(config.logging.effective_level(), "info");
            Ok(())
        });
    }

    #[test]
    fn explicit_file_then_prefixed_env_then_legacy_env() {
        Jail::expect_with(|jail| {
            isolate(jail);
            jail.create_file(
                "agent.toml",
                r#"
                [agent]
                agent_type = "DATA"

                [[agent.subscriptions]]
                destination = "/queue/panda.transformer.slices"
                ack = "client-individual"
                selector = "task_id = 'a1'"

                [broker]
                host = "file-host"
                port = 61613
                "#,
            )?;
            jail.set_env("SWF_AGENT_BROKER__PORT", "61614");
            jail.set_env("SWF_AGENT_RUNTIME__POLL_INTERVAL_SECS", "5");
            jail.set_env("ACTIVEMQ_HOST", "env-host");

            let config = ConfigLoader::new("swf-agent")
                .with_file("agent.toml")
                .load()
                .expect("layered load");

            assert_eq!(config.agent.agent_type, "DATA");
            assert_eq!(config.broker.host, "env-host");
            assert_eq!(config.broker.port, 61614);
            assert_eq!(config.runtime.poll_interval_secs, 5);
            let sub = &config.agent.subscriptions[0];
            assert_eq!(sub.ack, AckMode::ClientIndividual);
            assert_eq!(sub.prefetch, 1);
            assert_eq!(sub.selector.as_deref(), Some("task_id = 'a1'"));
            Ok(())
        });
    }

    #[test]
    fn user_config_dir_is_layered() {
        Jail::expect_with(|jail| {
            isolate(jail);
            jail.create_dir("swf")?;
            jail.create_file("swf/agent.toml", "[broker]\nuser = \"alice\"\n")?;
            let config = ConfigLoader::new("swf-agent").load().expect("load");
            assert_eq!(config.broker.user, "alice");
            Ok(())
        });
    }

    #[test]
    fn legacy_flags_accept_truthy_words() {
        Jail::expect_with(|jail| {
            isolate(jail);
            jail.set_env("SWF_AGENT_QUIET", "yes");
            jail.set_env("SWF_STOMP_DEBUG", "1");
            jail.set_env("SWF_API_TOKEN", "12345");
            jail.set_env("SWF_MONITOR_URL", "https://monitor.example/swf-monitor/");
            let config = ConfigLoader::new("swf-agent").load().expect("load");
            assert!(config.logging.quiet);
            assert!(config.logging.broker_debug);
            assert_eq!(config.logging.effective_level(), "warn");
            assert_eq!(config.monitor.api_token.as_deref(), Some("12345"));
            assert_eq!(
                config.monitor.base_url(),
                Some("https://monitor.example/swf-monitor")
            );
            Ok(())
        });
    }

    #[test]
    fn missing_explicit_file_is_reported() {
        Jail::expect_with(|jail| {
            isolate(jail);
            let err = ConfigLoader::new("swf-agent")
                .with_file("nope.toml")
                .load()
                .expect_err("missing file");
            assert!(matches!(err, ConfigError::FileNotFound { .. }));
            Ok(())
        });
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.broker.port = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.broker.connect_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.runtime.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config
            .agent
            .subscriptions
            .push(SubscriptionConfig::new("epictopic"));
        let err = config.validate().expect_err("bad destination");
        assert!(err.to_string().contains("must start with '/queue/' or '/topic/'"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = AgentConfig::default();
        config.broker.password = "hunter2".to_owned();
        config.monitor.api_token = Some("tok".to_owned());
        let shown = format!("{config:?}");
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("\"tok\""));
    }

    #[test]
    fn connect_params_carry_client_id() {
        let params = BrokerConfig::default().connect_params("data-agent-bob-4");
        assert_eq!(params.client_id, "data-agent-bob-4");
        assert_eq!(params.address(), "localhost:61612");
        assert_eq!(params.vhost, "localhost");
    }

    #[test]
    fn ssl_settings_come_from_deployment_variables() {
        Jail::expect_with(|jail| {
            isolate(jail);
            jail.create_file("ca.pem", "")?;
            let ca = jail.directory().join("ca.pem");
            jail.set_env("ACTIVEMQ_USE_SSL", "true");
            jail.set_env("ACTIVEMQ_SSL_CA_CERTS", ca.display());
            let config = ConfigLoader::new("swf-agent").load().expect("load");
            assert!(config.broker.use_ssl);
            config.validate().expect("CA file exists");
            let tls = config.broker.connect_params("a").tls.expect("tls enabled");
            assert_eq!(tls.ca_certs.as_deref(), Some(ca.as_path()));
            Ok(())
        });
    }

    #[test]
    fn empty_ca_path_means_platform_roots() {
        Jail::expect_with(|jail| {
            isolate(jail);
            jail.set_env("ACTIVEMQ_USE_SSL", "true");
            jail.set_env("ACTIVEMQ_SSL_CA_CERTS", "");
            let config = ConfigLoader::new("swf-agent").load().expect("load");
            assert_eq!(config.broker.ssl_ca_certs, None);
            let tls = config.broker.connect_params("a").tls.expect("tls enabled");
            assert_eq!(tls.ca_certs, None);
            Ok(())
        });
    }

    #[test]
    fn plain_tcp_by_default_and_missing_ca_file_is_invalid() {
        assert!(BrokerConfig::default().connect_params("a").tls.is_none());

        let mut config = AgentConfig::default();
        config.broker.use_ssl = true;
        config.broker.ssl_ca_certs = Some(PathBuf::from("/nonexistent/ca.pem"));
        let err = config.validate().expect_err("missing CA file");
        assert!(err.to_string().contains("SSL CA certificate file not found"));
    }

    #[test]
    fn testbed_namespace_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("testbed.toml");
        std::fs::write(&path, "[testbed]\nnamespace = \"collab-dec29\"\n").expect("write");
        let testbed = TestbedConfig::load(&path).expect("valid testbed file");
        assert_eq!(testbed.namespace, "collab-dec29");
    }

    #[test]
    fn testbed_errors_are_specific() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cases = [
            ("missing.toml", None, "not found"),
            ("bad.toml", Some("[testbed\nnamespace ="), "Invalid TOML"),
            ("nosection.toml", Some("[other]\nx = 1\n"), "Missing [testbed] section"),
            ("nokey.toml", Some("[testbed]\nother = 1\n"), "Missing 'namespace'"),
            ("empty.toml", Some("[testbed]\nnamespace = \"\"\n"), "Namespace not configured"),
        ];
        for (name, contents, expected) in cases {
            let path = dir.path().join(name);
            if let Some(contents) = contents {
                std::fs::write(&path, contents).expect("write");
            }
            let err = TestbedConfig::load(&path).expect_err(name);
            assert!(
                matches!(err, ConfigError::Testbed { .. }),
                "{name}: {err}"
            );
            assert!(err.to_string().contains(expected), "{name}: {err}");
        }
    }
}
