//! Monitoring check
//!
//! Finds the one server registered under a path and pings its storage
//! endpoint. When several servers share a path, the server's monitor
//! listener says which one is ours.

use crate::common::{blocking, Address, Error, Result};
use crate::common::config::DEFAULT_SESSION_TIMEOUT;
use crate::registry::{self, Connector};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Nagios exit codes
pub const OK: i32 = 0;
pub const CRITICAL: i32 = 2;

/// Send one command to a monitor listener and return its trimmed reply.
pub async fn query_monitor(monitor: &Address, command: &str, timeout: Duration) -> Result<String> {
    let exchange = async {
        let mut stream = TcpStream::connect((monitor.bind_host(), monitor.port))
            .await
            .map_err(|e| Error::Monitor(format!("Can't connect {}", e)))?;
        stream.write_all(format!("{}\n", command).as_bytes()).await?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok::<_, Error>(reply.trim().to_string())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout(format!("monitor at {}", monitor)))?
}

/// Address of the server registered under `path`.
pub async fn find_server(
    connector: Arc<dyn Connector>,
    zookeeper: &str,
    path: &str,
    monitor: Option<&Address>,
    timeout: Duration,
) -> Result<Address> {
    let mut wanted = None;
    if let Some(monitor) = monitor {
        let reply = query_monitor(monitor, &format!("servers {}", path), timeout).await?;
        if reply.to_lowercase().starts_with("invalid ") {
            return Err(Error::Monitor(format!("{} at {}", reply, monitor)));
        }

        let servers: BTreeSet<&str> = reply.split_whitespace().collect();
        let server = match servers.len() {
            0 => return Err(Error::Monitor(format!("No servers at: {}", monitor))),
            1 => servers.iter().next().copied().unwrap_or_default(),
            _ => {
                return Err(Error::Monitor(format!(
                    "Too many servers, {:?}, at: {}",
                    servers, monitor
                )))
            }
        };
        wanted = Some(Address::parse(server)?);
    }

    let session = registry::connect(connector, zookeeper, DEFAULT_SESSION_TIMEOUT).await?;
    let lookup = path.to_string();
    let children = blocking(move || {
        let children = session.children(&lookup);
        let _ = session.close();
        children
    })
    .await?;

    let mut names = children.snapshot();
    if let Some(wanted) = &wanted {
        names.retain(|name| match Address::parse(name) {
            // A wildcard-bound server is only known by its port.
            Ok(child) if wanted.is_unspecified() => child.port == wanted.port,
            Ok(child) => child == *wanted,
            Err(_) => false,
        });
    }

    match names.as_slice() {
        [name] => Address::parse(name),
        _ => Err(Error::Other("Couldn't find server in ZooKeeper".into())),
    }
}

/// Ping a storage endpoint, returning the round trip time.
pub async fn check_server(address: &Address, timeout: Duration) -> Result<Duration> {
    let started = Instant::now();
    tokio::time::timeout(timeout, ping(address))
        .await
        .map_err(|_| Error::Timeout(format!("ping {}", address)))??;
    Ok(started.elapsed())
}

async fn ping(address: &Address) -> Result<()> {
    let stream = TcpStream::connect((address.bind_host(), address.port)).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"ping\n").await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(line) if line.trim() == "pong" => Ok(()),
        Some(line) => Err(Error::Other(format!("Unexpected reply {:?}", line))),
        None => Err(Error::Other("Connection closed".into())),
    }
}

/// Run the whole check, returning the exit code and a one-line report.
pub async fn run(
    connector: Arc<dyn Connector>,
    zookeeper: &str,
    path: &str,
    monitor: Option<&Address>,
    timeout: Duration,
) -> (i32, String) {
    let address = match find_server(connector, zookeeper, path, monitor, timeout).await {
        Ok(address) => address,
        Err(e) => return (CRITICAL, e.to_string()),
    };

    match check_server(&address, timeout).await {
        Ok(elapsed) => (
            OK,
            format!("{} responded in {:.3} seconds", address, elapsed.as_secs_f64()),
        ),
        Err(e) => (CRITICAL, format!("{}: {}", address, e)),
    }
}
