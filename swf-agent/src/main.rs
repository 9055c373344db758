#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use swf_agent::{Agent, DestinationPattern, WorkflowLogger};
use swf_common::config::SubscriptionConfig;
use swf_common::{ConfigLoader, TestbedConfig, monitor, telemetry};
use swf_stomp::StompTransport;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "swf-agent")]
#[command(about = "SWF testbed messaging agent")]
#[command(version)]
struct Cli {
    /// Agent type reported to the monitor (e.g. DATA, PROCESSING)
    #[arg(short = 't', long)]
    agent_type: Option<String>,

    /// Destination to subscribe to, /queue/<name> or /topic/<name>; repeatable
    #[arg(short, long = "subscribe", value_name = "DEST")]
    subscribe: Vec<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Testbed configuration file holding the namespace
    #[arg(long)]
    testbed_config: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log broker wire traffic
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env_file = telemetry::load_user_env();

    let mut loader = ConfigLoader::new("swf-agent");
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load()?;

    if let Some(agent_type) = cli.agent_type {
        config.agent.agent_type = agent_type;
    }
    config
        .agent
        .subscriptions
        .extend(cli.subscribe.into_iter().map(SubscriptionConfig::new));
    if cli.testbed_config.is_some() {
        config.agent.testbed_config = cli.testbed_config;
    }
    if cli.log_level.is_some() {
        config.logging.level = cli.log_level;
    }
    if cli.debug {
        config.logging.broker_debug = true;
    }
    config.validate()?;

    telemetry::initialize(&config.logging);
    if let Some(path) = env_file {
        info!(path = %path.display(), "Loaded environment file");
    }

    // Test mode: exit after validating configuration (SWF_AGENT_TEST_MODE=1)
    if std::env::var("SWF_AGENT_TEST_MODE").is_ok_and(|v| v == "1") {
        #[allow(clippy::print_stdout)]
        {
            println!("swf-agent started successfully");
        }
        return Ok(());
    }

    let namespace = match &config.agent.testbed_config {
        Some(path) => {
            let testbed = TestbedConfig::load(path)?;
            info!(namespace = %testbed.namespace, "Testbed namespace");
            Some(testbed.namespace)
        }
        None => {
            warn!("No testbed configuration, running without namespace");
            None
        }
    };

    let monitor =
        monitor::from_config(&config.monitor).context("Failed to create monitor client")?;
    let agent = Agent::new(config, Box::new(StompTransport::new()), monitor, namespace)
        .await
        .context("Failed to initialize agent")?;
    agent.route(DestinationPattern::prefix("/"), Arc::new(WorkflowLogger));
    agent.run().await?;
    Ok(())
}
