//! Reconnecting storage client
//!
//! The [`ConnectionManager`] owns the authoritative address list. While the
//! client runs, its connector task works from its own [`InFlight`] copy of
//! that list; both are only changed under the manager's lock.

use crate::common::{Address, Error, Result};
use crate::storage::{AddressCapability, StorageClient};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// First delay after a failed round of connection attempts
    pub min_disconnect_poll: Duration,
    /// Cap for the reconnect delay
    pub max_disconnect_poll: Duration,
    /// Timeout for a single TCP connect
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            min_disconnect_poll: Duration::from_millis(100),
            max_disconnect_poll: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Address list used by a running connector task.
#[derive(Debug, Default)]
pub struct InFlight {
    addrlist: Mutex<Vec<Address>>,
    wake: Notify,
}

impl InFlight {
    fn new(addrlist: Vec<Address>) -> Self {
        Self {
            addrlist: Mutex::new(addrlist),
            wake: Notify::new(),
        }
    }

    pub fn addrlist(&self) -> Vec<Address> {
        self.addrlist.lock().clone()
    }

    pub fn set_addrlist(&self, addrlist: Vec<Address>) {
        *self.addrlist.lock() = addrlist;
    }

    /// Cut the current reconnect delay short.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

/// Fields guarded by the manager's lock.
#[derive(Debug, Default)]
pub struct ManagerState {
    pub addrlist: Vec<Address>,
    /// Present while a connector task is running
    pub connector: Option<Arc<InFlight>>,
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(addrlist: Vec<Address>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                addrlist,
                connector: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.state.lock().addrlist.clone()
    }
}

/// Storage client that keeps one TCP connection to any of its addresses.
#[derive(Debug)]
pub struct Client {
    manager: Arc<ConnectionManager>,
    status: watch::Receiver<Option<Address>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Start a client on `addresses`. Must be called inside a tokio runtime.
    pub fn new(addresses: Vec<Address>, options: ClientOptions) -> Arc<Self> {
        let manager = Arc::new(ConnectionManager::new(addresses.clone()));
        let inflight = Arc::new(InFlight::new(addresses));
        manager.lock().connector = Some(inflight.clone());

        let (status_tx, status) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_connector(inflight, status_tx, options, shutdown_rx));

        Arc::new(Self {
            manager,
            status,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.manager.addresses()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_some()
    }

    pub fn connected_to(&self) -> Option<Address> {
        self.status.borrow().clone()
    }

    /// Wait for a connection, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<Address> {
        let mut status = self.status.clone();
        let connected = tokio::time::timeout(timeout, status.wait_for(|addr| addr.is_some()))
            .await
            .map_err(|_| Error::Timeout("waiting for a storage connection".into()))?
            .map_err(|_| Error::Other("client closed".into()))?;
        connected
            .clone()
            .ok_or_else(|| Error::Internal("connection vanished".into()))
    }

    /// Replace the address list and retry right away if disconnected.
    ///
    /// An established connection is kept even if its address is no longer
    /// listed; the new list applies to the next connection attempt.
    pub fn new_addresses(&self, addresses: Vec<Address>) {
        let mut state = self.manager.lock();
        state.addrlist = addresses.clone();
        if let Some(inflight) = &state.connector {
            inflight.set_addrlist(addresses);
            inflight.wake();
        }
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.manager.lock().connector = None;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl StorageClient for Client {
    fn capability(&self) -> AddressCapability {
        AddressCapability::Replace
    }

    fn new_addresses(&self, addresses: Vec<Address>) -> Result<()> {
        Client::new_addresses(self, addresses);
        Ok(())
    }

    fn connection_manager(&self) -> Option<Arc<ConnectionManager>> {
        Some(self.manager.clone())
    }

    fn close(&self) {
        Client::close(self);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connector(
    inflight: Arc<InFlight>,
    status: watch::Sender<Option<Address>>,
    options: ClientOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = options.min_disconnect_poll;

    loop {
        let addresses = inflight.addrlist();
        if let Some((addr, stream)) = connect_any(&addresses, options.connect_timeout).await {
            tracing::info!("Connected to storage server {}", addr);
            status.send_replace(Some(addr.clone()));
            delay = options.min_disconnect_poll;

            tokio::select! {
                _ = hold(stream) => {
                    tracing::warn!("Disconnected from storage server {}", addr);
                    status.send_replace(None);
                }
                _ = stopped(&mut shutdown) => {
                    status.send_replace(None);
                    return;
                }
            }
            continue;
        }

        if addresses.is_empty() {
            tracing::debug!("No storage addresses to connect to");
        } else {
            tracing::debug!(
                "Couldn't connect to any of {} addresses, retrying in {:?}",
                addresses.len(),
                delay
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inflight.wake.notified() => {}
            _ = stopped(&mut shutdown) => return,
        }
        delay = (delay * 2).min(options.max_disconnect_poll);
    }
}

async fn connect_any(addresses: &[Address], timeout: Duration) -> Option<(Address, TcpStream)> {
    for addr in addresses {
        let attempt = TcpStream::connect((addr.bind_host(), addr.port));
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(stream)) => return Some((addr.clone(), stream)),
            Ok(Err(e)) => tracing::debug!("Connect to {} failed: {}", addr, e),
            Err(_) => tracing::debug!("Connect to {} timed out", addr),
        }
    }
    None
}

/// Resolve once shutdown is requested or the client is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Resolve once the peer closes the connection.
async fn hold(mut stream: TcpStream) {
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; 512];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
