// relay: reconciles BMC event subscriptions and relays pushed events
// to the bus.

use clap::{Arg, Command};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let matches = Command::new("relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Redfish telemetry and event relay")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to the TOML config file")
                .value_name("path")
                .default_value("/etc/redfish-relay/relay.toml"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Override the configured log level")
                .value_name("level"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .expect("config has a default value");

    let cfg = match relay::config::load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| cfg.general.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "relay starting"
    );

    if let Err(e) = relay::run(config_path, cfg).await {
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
