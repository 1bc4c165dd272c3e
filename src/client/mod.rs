//! Registry-aware storage clients
//!
//! Opening a client:
//! 1. connect to the registry (a failure is returned right away);
//! 2. read the children of the configured path;
//! 3. optionally wait for at least one address;
//! 4. build the storage client on the resolved addresses;
//! 5. keep its address list in step with the registry.

pub mod binder;
pub mod wait;

pub use binder::{address_sink, bind_addresses, AddressSink, ManagerSink, ReplacingSink};
pub use wait::{wait_for_addresses, WaitOptions, POLL_INTERVAL, WARN_EVERY_POLLS};

use crate::common::{blocking, Address, ClientConfig, Result};
use crate::registry::{connect, ChangeWatch, Children, Connector, Coordinator};
use crate::storage::{self, ClientOptions, StorageClient};
use std::ops::Deref;
use std::sync::Arc;

/// A storage client whose addresses come from the registry.
pub struct ZkClient<C: StorageClient> {
    client: Arc<C>,
    coordinator: Arc<dyn Coordinator>,
    addresses: Children,
    target: String,
    _watch: ChangeWatch,
}

impl<C: StorageClient> ZkClient<C> {
    pub fn storage(&self) -> &Arc<C> {
        &self.client
    }

    /// The live registry view feeding this client.
    pub fn registry_addresses(&self) -> &Children {
        &self.addresses
    }

    /// `<connection><path>`, as used in log messages.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Close the storage client, then the registry session.
    pub async fn close(self) -> Result<()> {
        self.client.close();
        let coordinator = self.coordinator.clone();
        blocking(move || coordinator.close()).await
    }
}

impl<C: StorageClient> Deref for ZkClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

/// Open a client built by `make` from the resolved addresses.
pub async fn open_client<C, F>(
    connector: Arc<dyn Connector>,
    config: &ClientConfig,
    wait_options: WaitOptions,
    make: F,
) -> Result<ZkClient<C>>
where
    C: StorageClient,
    F: FnOnce(Vec<Address>) -> Result<Arc<C>>,
{
    config.validate()?;
    let coordinator = connect(connector, config.zookeeper.as_str(), config.session_timeout()).await?;

    match resolve_and_bind(coordinator.clone(), config, wait_options, make).await {
        Ok(client) => Ok(client),
        Err(e) => {
            let _ = blocking(move || coordinator.close()).await;
            Err(e)
        }
    }
}

async fn resolve_and_bind<C, F>(
    coordinator: Arc<dyn Coordinator>,
    config: &ClientConfig,
    wait_options: WaitOptions,
    make: F,
) -> Result<ZkClient<C>>
where
    C: StorageClient,
    F: FnOnce(Vec<Address>) -> Result<Arc<C>>,
{
    let path = config.server.clone();
    let session = coordinator.clone();
    let addresses = blocking(move || session.children(&path)).await?;
    let target = format!("{}{}", config.zookeeper, config.server);

    let initial = wait_for_addresses(&addresses, &target, config.wait, wait_options).await?;
    let client = make(initial)?;
    let sink = address_sink(client.clone())?;
    let watch = bind_addresses(&addresses, sink, target.clone());

    Ok(ZkClient {
        client,
        coordinator,
        addresses,
        target,
        _watch: watch,
    })
}

/// Open the built-in storage [`storage::Client`].
pub async fn client(
    connector: Arc<dyn Connector>,
    config: &ClientConfig,
) -> Result<ZkClient<storage::Client>> {
    let options = ClientOptions {
        max_disconnect_poll: config.max_disconnect_poll(),
        ..ClientOptions::default()
    };
    open_client(connector, config, WaitOptions::default(), move |addresses| {
        Ok(storage::Client::new(addresses, options))
    })
    .await
}
