//! Storage server endpoint

use crate::common::{Address, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// A bound storage endpoint. Clients keep a connection open; `ping` lines
/// are answered with `pong`.
pub struct StorageServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl StorageServer {
    /// Bind `address`; port 0 lets the OS pick one.
    pub async fn bind(address: &Address) -> Result<Self> {
        let listener = TcpListener::bind((address.bind_host(), address.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Storage server listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address actually bound, including an OS-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` turns true or its sender is
    /// dropped, then drop every open connection.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Storage connection from {}", peer);
                        connections.spawn(handle_connection(stream, peer));
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        tracing::info!(
            "Storage server on {} closing {} connections",
            self.local_addr,
            connections.len()
        );
        connections.shutdown().await;
        Ok(())
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let reply = match line.trim() {
                    "ping" => "pong\n".to_string(),
                    other => format!("error unknown command {:?}\n", other),
                };
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Storage connection {} failed: {}", peer, e);
                break;
            }
        }
    }
    tracing::debug!("Storage connection from {} closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ephemeral_port_and_ping() {
        let server = StorageServer::bind(&Address::new("127.0.0.1", 0))
            .await
            .unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let (shutdown, rx) = watch::channel(false);
        let serving = tokio::spawn(server.serve(rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"ping\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "pong");

        shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Connections are dropped on shutdown.
        let eof = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap();
        assert!(matches!(eof, Ok(None) | Err(_)));
    }
}
