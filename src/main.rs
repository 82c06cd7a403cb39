use anyhow::Result;
use reverse_tunnel_agent::{load_config, supervisor};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_file = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
    let config = load_config(&config_file)?;
    info!(
        config_file = %config_file.display(),
        relay = %config.relay.address,
        services = config.services.len(),
        "Configuration loaded"
    );

    supervisor::run(config).await
}
