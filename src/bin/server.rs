//! Storage server binary with ZooKeeper registration

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zkzeo::{common::parse_duration, registry, Config, ZkServer};

#[derive(Parser)]
#[command(name = "zkzeo-server")]
#[command(about = "Storage server that registers itself with ZooKeeper")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Listen address; a missing or zero port picks one
    #[arg(long)]
    address: Option<String>,

    /// ZooKeeper connection string
    #[arg(long)]
    zookeeper: Option<String>,

    /// Registry path to register under
    #[arg(long)]
    path: Option<String>,

    /// Session timeout (e.g. "10s", "4242ms")
    #[arg(long, value_parser = parse_timeout)]
    session_timeout: Option<u64>,

    /// Monitor listener address; the port may be omitted
    #[arg(long)]
    monitor_server: Option<String>,

    /// Wait for ZooKeeper in the background
    #[arg(long, overrides_with = "no_wait")]
    wait: bool,

    /// Fail startup if ZooKeeper can't be reached
    #[arg(long, overrides_with = "wait")]
    no_wait: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_timeout(s: &str) -> Result<u64, String> {
    let duration = parse_duration(s).map_err(|e| e.to_string())?;
    u64::try_from(duration.as_millis()).map_err(|_| format!("timeout too large: {}", s))
}

impl Cli {
    /// CLI arguments take priority over the file and the environment.
    fn apply(self, config: &mut Config) {
        if let Some(address) = self.address {
            config.server.address = address;
        }
        let zookeeper = &mut config.zookeeper;
        if let Some(connection) = self.zookeeper {
            zookeeper.connection = Some(connection);
        }
        if let Some(path) = self.path {
            zookeeper.path = Some(path);
        }
        if let Some(timeout) = self.session_timeout {
            zookeeper.session_timeout_ms = Some(timeout);
        }
        if let Some(monitor) = self.monitor_server {
            zookeeper.monitor_server = Some(monitor);
        }
        if self.wait {
            zookeeper.wait = Some(true);
        } else if self.no_wait {
            zookeeper.wait = Some(false);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("zkzeo-server {}", zkzeo::VERSION);

    let server = ZkServer::new(config, registry::default_connector())
        .start()
        .await?;
    tracing::info!("Serving on {}", server.local_addr());

    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Can't listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("4242ms"), Ok(4242));
        assert_eq!(parse_timeout("10s"), Ok(10_000));
        assert!(parse_timeout("18446744073709551615s").is_err());
    }
}
