//! Monitor listener
//!
//! A line protocol for operators and `zkzeo-check`. Each connection carries
//! one request; the reply is written and the connection closed.
//!
//! ```text
//! servers <path>   addresses this process registered under <path>
//! status           registrar state
//! ```

use crate::common::{Address, Error, Result};
use crate::server::registrar::RegistrarState;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Addresses registered by this process, per registry path.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    inner: Arc<RwLock<BTreeMap<String, BTreeSet<Address>>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, address: Address) {
        self.inner
            .write()
            .entry(path.to_string())
            .or_default()
            .insert(address);
    }

    pub fn remove(&self, path: &str, address: &Address) {
        let mut inner = self.inner.write();
        if let Some(servers) = inner.get_mut(path) {
            servers.remove(address);
            if servers.is_empty() {
                inner.remove(path);
            }
        }
    }

    pub fn servers(&self, path: &str) -> Vec<Address> {
        self.inner
            .read()
            .get(path)
            .map(|servers| servers.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// A running monitor listener.
#[derive(Debug)]
pub struct Monitor {
    configured: Address,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Monitor {
    /// Listen on `address` (port 0 picks one).
    pub async fn start(
        address: &Address,
        directory: Directory,
        state: watch::Receiver<RegistrarState>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((address.bind_host(), address.port))
            .await
            .map_err(|e| Error::Monitor(format!("can't listen on {}: {}", address, e)))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Monitor listening on {}", local_addr);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, directory, state, shutdown_rx));

        Ok(Self {
            configured: address.clone(),
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configured host with the bound port, as advertised in the
    /// `monitor` property.
    pub fn address(&self) -> Address {
        Address::new(self.configured.host.clone(), self.local_addr.port())
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        let _ = self.task.await;
        tracing::info!("Monitor on {} stopped", self.local_addr);
    }
}

async fn serve(
    listener: TcpListener,
    directory: Directory,
    state: watch::Receiver<RegistrarState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let directory = directory.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_request(stream, &directory, &state).await {
                            tracing::debug!("Monitor request from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Monitor accept failed: {}", e),
            },
            _ = stopped(&mut shutdown) => break,
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn handle_request(
    stream: TcpStream,
    directory: &Directory,
    state: &watch::Receiver<RegistrarState>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let current = *state.borrow();
    let mut reply = respond(line.trim(), directory, current);
    reply.push('\n');
    writer.write_all(reply.as_bytes()).await?;
    writer.shutdown().await
}

/// Answer one request line.
pub fn respond(line: &str, directory: &Directory, state: RegistrarState) -> String {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("servers"), Some(path), None) => {
            let servers = directory.servers(path);
            if servers.is_empty() {
                format!("Invalid path: {}", path)
            } else {
                servers
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        }
        (Some("status"), None, None) => state.to_string(),
        _ => format!("Invalid command: {}", line),
    }
}
