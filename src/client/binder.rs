//! Forward registry changes into a storage client's address list
//!
//! The storage client is reached through one narrow interface,
//! [`AddressSink`]. Which adapter backs it is decided once, when the sink is
//! built, from the client's [`AddressCapability`].

use crate::common::{parse_addresses, Address, Error, Result};
use crate::registry::{ChangeWatch, Children};
use crate::storage::{AddressCapability, ConnectionManager, StorageClient};
use std::sync::Arc;

/// Receives every new non-empty address list.
pub trait AddressSink: Send + Sync {
    fn set_addresses(&self, addresses: Vec<Address>);
}

/// Uses the client's own `new_addresses`.
pub struct ReplacingSink<C: StorageClient> {
    client: Arc<C>,
}

impl<C: StorageClient> AddressSink for ReplacingSink<C> {
    fn set_addresses(&self, addresses: Vec<Address>) {
        if let Err(e) = self.client.new_addresses(addresses) {
            tracing::error!("Storage client rejected new addresses: {}", e);
        }
    }
}

/// For clients without `new_addresses`: rewrites the connection manager's
/// list and the running connector's copy under the manager's lock. The
/// connector picks the list up on its next attempt.
pub struct ManagerSink {
    manager: Arc<ConnectionManager>,
}

impl ManagerSink {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

impl AddressSink for ManagerSink {
    fn set_addresses(&self, addresses: Vec<Address>) {
        let mut state = self.manager.lock();
        state.addrlist = addresses.clone();
        if let Some(connector) = &state.connector {
            connector.set_addrlist(addresses);
        }
    }
}

/// Pick the sink for `client`.
pub fn address_sink<C: StorageClient>(client: Arc<C>) -> Result<Arc<dyn AddressSink>> {
    match client.capability() {
        AddressCapability::Replace => Ok(Arc::new(ReplacingSink { client })),
        AddressCapability::ManagerOnly => {
            let manager = client.connection_manager().ok_or_else(|| {
                Error::Unsupported(
                    "storage client exposes neither new_addresses nor a connection manager".into(),
                )
            })?;
            Ok(Arc::new(ManagerSink::new(manager)))
        }
    }
}

/// Keep `sink` in step with `children`.
///
/// The callback runs once right away and then on every change. An empty
/// child set is logged and otherwise ignored, so the client keeps its last
/// known addresses. A malformed node name rejects the whole update.
pub fn bind_addresses(children: &Children, sink: Arc<dyn AddressSink>, target: String) -> ChangeWatch {
    let mut warned = false;

    children.on_change(move |names| {
        let addresses = match parse_addresses(names) {
            Ok(addresses) => addresses,
            Err(e) => {
                tracing::error!("Ignoring addresses from <{}>: {}", target, e);
                return;
            }
        };

        if addresses.is_empty() {
            tracing::warn!("No addresses from <{}>", target);
            warned = true;
            return;
        }

        if warned {
            tracing::warn!("OK: Addresses from <{}>", target);
            warned = false;
        }
        tracing::info!("Addresses from <{}>: {:?}", target, names);
        sink.set_addresses(addresses);
    })
}
