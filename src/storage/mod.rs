//! Storage client and server endpoints
//!
//! zkzeo doesn't speak the storage protocol itself. This module holds the
//! contract it needs from a storage client ([`StorageClient`]) plus a minimal
//! TCP client and server so that registration and discovery can run end to
//! end.

pub mod connection;
pub mod server;

pub use connection::{Client, ClientOptions, ConnectionManager, InFlight, ManagerState};
pub use server::StorageServer;

use crate::common::{Address, Error, Result};
use std::sync::Arc;

/// How a storage client lets its address list be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressCapability {
    /// The client has a native `new_addresses` operation.
    Replace,
    /// Only the connection manager's fields can be updated.
    ManagerOnly,
}

/// What zkzeo needs from a storage client.
pub trait StorageClient: Send + Sync + 'static {
    /// Which address replacement path this client supports.
    fn capability(&self) -> AddressCapability {
        AddressCapability::ManagerOnly
    }

    /// Replace the address list. Only called for [`AddressCapability::Replace`].
    fn new_addresses(&self, _addresses: Vec<Address>) -> Result<()> {
        Err(Error::Unsupported(
            "client can't replace its addresses".into(),
        ))
    }

    /// The connection manager holding the client's address list, if the
    /// client exposes one.
    fn connection_manager(&self) -> Option<Arc<ConnectionManager>>;

    /// Shut the client down.
    fn close(&self) {}
}
