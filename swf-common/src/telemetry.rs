//! Process-wide logging setup.
//!
//! [`initialize`] installs the global `tracing` subscriber exactly once per
//! process; later calls are no-ops. `RUST_LOG` wins over the configured
//! level when present.

use crate::config::{LogFormat, LoggingConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Target of the wire-level STOMP crate
pub const BROKER_TARGET: &str = "swf_stomp";

static INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Filter directives derived from `config`.
///
/// Returns the directive string and, when the configured level was not
/// recognized, the rejected value.
pub fn filter_directives(config: &LoggingConfig) -> (String, Option<String>) {
    let requested = config.effective_level();
    let normalized = match requested.to_ascii_lowercase().as_str() {
        "warning" => "warn".to_owned(),
        "critical" | "fatal" => "error".to_owned(),
        other => other.to_owned(),
    };
    let (level, rejected) = match LevelFilter::from_str(&normalized) {
        Ok(level) => (level, None),
        Err(_) => (LevelFilter::INFO, Some(requested.to_owned())),
    };
    let broker = if config.broker_debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let level = level.to_string().to_lowercase();
    let broker = broker.to_string().to_lowercase();
    (format!("{level},{BROKER_TARGET}={broker}"), rejected)
}

/// Install the global subscriber once. Returns whether a subscriber was installed.
pub fn initialize(config: &LoggingConfig) -> bool {
    *INITIALIZED.get_or_init(|| install(config))
}

fn install(config: &LoggingConfig) -> bool {
    let (directives, rejected) = filter_directives(config);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::builder().parse_lossy(&directives));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Human => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };

    if let Some(level) = rejected {
        warn!(
            level = %level,
            valid = "trace, debug, info, warn, error",
            "Invalid log level, using info"
        );
    }
    if installed {
        debug!(directives = %directives, "Logging initialized");
    }
    installed
}

/// Load `~/.env` into the process environment without overriding variables
/// that are already set. Returns the file that was loaded.
pub fn load_user_env() -> Option<PathBuf> {
    let path = dirs::home_dir()?.join(".env");
    if !path.exists() {
        return None;
    }
    match dotenvy::from_path(&path) {
        Ok(()) => Some(path),
        Err(e) => {
            // logging is usually not installed yet
            #[allow(clippy::print_stderr)]
            {
                eprintln!("warning: could not load {}: {e}", path.display());
            }
            None
        }
    }
}
