//! Nagios-style check for a registered storage server

use clap::Parser;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zkzeo::{check, common::parse_duration, registry, Address};

#[derive(Parser)]
#[command(name = "zkzeo-check")]
#[command(about = "Look up a storage server in ZooKeeper and check that it responds")]
#[command(version)]
struct Cli {
    /// ZooKeeper connection string
    zookeeper: String,

    /// Registry path the server is registered under
    path: String,

    /// Monitor listener of the server to check, needed when several
    /// servers share the path
    #[arg(short = 'M', long)]
    monitor_address: Option<String>,

    /// Timeout for each network exchange
    #[arg(long, default_value = "5s", value_parser = parse_timeout)]
    timeout: Duration,
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let monitor = match cli.monitor_address.as_deref().map(Address::parse).transpose() {
        Ok(monitor) => monitor,
        Err(e) => {
            println!("CRITICAL: {}", e);
            std::process::exit(check::CRITICAL);
        }
    };

    let (code, report) = check::run(
        registry::default_connector(),
        &cli.zookeeper,
        &cli.path,
        monitor.as_ref(),
        cli.timeout,
    )
    .await;

    let status = if code == check::OK { "OK" } else { "CRITICAL" };
    println!("{}: {}", status, report);
    std::process::exit(code);
}
