//! Storage server launcher
//!
//! Binds the storage endpoint first, reads the port actually bound, then
//! registers that address. Registration runs inline when the listen port is
//! ephemeral (a failure aborts startup) and on a background task when it is
//! fixed, unless `zookeeper.wait` says otherwise. The monitor listener is
//! bound before either, so a bad monitor address fails startup.

pub mod monitor;
pub mod registrar;

pub use monitor::{Directory, Monitor};
pub use registrar::{Registrar, RegistrarState, Registration};

use crate::common::{Address, Config, Error, Result};
use crate::registry::Connector;
use crate::storage::StorageServer;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct ZkServer {
    config: Config,
    connector: Arc<dyn Connector>,
}

impl ZkServer {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Bind, start serving and register.
    pub async fn start(self) -> Result<RunningServer> {
        self.config.validate()?;
        let requested = Address::parse_bind(&self.config.server.address)?;
        let registration = Registration::from_config(&self.config.zookeeper, requested.port)?;

        let storage = StorageServer::bind(&requested).await?;
        let local_addr = storage.local_addr();
        let bound = Address::new(requested.host.clone(), local_addr.port());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(storage.serve(shutdown_rx));
        let mut server = RunningServer {
            local_addr,
            registrar: None,
            shutdown,
            serving,
        };

        let Some(registration) = registration else {
            tracing::info!("No ZooKeeper registration configured, serving unregistered");
            return Ok(server);
        };

        let registrar = Registrar::new(self.connector, registration);
        server.registrar = Some(registrar.clone());
        // A monitor that can't listen aborts startup in either mode.
        if let Err(e) = registrar.start_monitor().await {
            tracing::error!("Can't start monitor: {}", e);
            let _ = server.close().await;
            return Err(e);
        }
        if registrar.registration().wait {
            tracing::info!(
                "Registering {} under {} in the background",
                bound,
                registrar.registration().path
            );
            registrar.spawn(bound);
        } else if let Err(e) = registrar.register(bound).await {
            let _ = server.close().await;
            return Err(e);
        }

        Ok(server)
    }
}

/// A started server; close it to deregister and stop serving.
pub struct RunningServer {
    local_addr: SocketAddr,
    registrar: Option<Arc<Registrar>>,
    shutdown: watch::Sender<bool>,
    serving: JoinHandle<Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registrar(&self) -> Option<&Arc<Registrar>> {
        self.registrar.as_ref()
    }

    /// Serve until `signal` resolves or the storage endpoint stops, then
    /// close.
    pub async fn serve_until<F>(mut self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let finished = tokio::select! {
            _ = signal => None,
            finished = &mut self.serving => Some(finished),
        };

        let Some(finished) = finished else {
            return self.close().await;
        };
        tracing::error!("Storage server on {} stopped unexpectedly", self.local_addr);
        if let Some(registrar) = &self.registrar {
            registrar.close().await?;
        }
        finished?
    }

    /// Deregister first, then drop client connections.
    pub async fn close(self) -> Result<()> {
        let deregistered = match &self.registrar {
            Some(registrar) => registrar.close().await,
            None => Ok(()),
        };

        self.shutdown.send_replace(true);
        self.serving
            .await
            .map_err(|e| Error::Internal(format!("storage server task: {}", e)))??;
        tracing::info!("Server on {} stopped", self.local_addr);
        deregistered
    }
}
