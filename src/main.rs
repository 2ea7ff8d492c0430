pub mod actor;
pub mod broker;
pub mod config;
pub mod proto;
pub mod registry;

use crate::actor::DeviceActorHandle;
use crate::broker::{mqtt::MqttBroker, BrokerClient, BrokerFactory};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const CONFIG_DIR: &str = "zm-device";
const CONFIG_FILE: &str = "config.toml";

/// Device registry actor serving the zmon device protocol over MQTT
#[derive(Parser, Debug)]
#[command(name = "zm-device", version, about)]
struct Args {
    /// Configuration file forwarded to the actor
    #[arg(short, long, env = "ZM_DEVICE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup(args.verbose)?;

    let config_path = args.config.unwrap_or_else(default_config_path);
    let config_text = tokio::fs::read_to_string(&config_path)
        .await
        .map_err(|e| eyre!("Failed to read {}: {}", config_path.display(), e))?;

    let factory: BrokerFactory = Box::new(|| Box::new(MqttBroker::new()) as Box<dyn BrokerClient>);
    let actor = DeviceActorHandle::spawn(factory)
        .await
        .map_err(|e| eyre!("Failed to spawn device actor: {}", e))?;

    if args.verbose {
        actor.verbose().await?;
    }
    actor
        .configure(&config_text)
        .await
        .map_err(|e| eyre!("Invalid configuration in {}: {}", config_path.display(), e))?;

    // A failed START leaves the actor idle, the broker may come up later
    if let Err(e) = actor.start().await {
        warn!("Device actor not connected: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutting down");

    actor.terminate().await?;
    Ok(())
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(if verbose { Level::DEBUG } else { Level::INFO });
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
