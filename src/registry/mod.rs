//! Service registry abstraction
//!
//! A registry is a tree of paths. Servers announce themselves by creating an
//! ephemeral child `host:port` under a path; clients list and watch those
//! children. Two backends are provided:
//! - [`memory::MemoryRegistry`]: in-process, used by tests and demos
//! - [`zookeeper::ZkConnector`]: a real ZooKeeper ensemble (feature `zookeeper`)

pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use memory::MemoryRegistry;

use crate::common::{Address, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Properties attached to a registration node, stored as a JSON object.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Opens registry sessions.
pub trait Connector: Send + Sync {
    /// Open a session. Fails with [`Error::FailedConnect`] if the ensemble
    /// can't be reached.
    fn connect(&self, connection: &str, session_timeout: Duration) -> Result<Arc<dyn Coordinator>>;
}

/// A live registry session.
///
/// Calls may block on network I/O; async callers go through
/// [`crate::common::blocking`].
pub trait Coordinator: Send + Sync {
    /// Live view of the children of `path`.
    fn children(&self, path: &str) -> Result<Children>;

    /// Create the ephemeral node `path/address` carrying `properties`.
    fn register_server(&self, path: &str, address: &Address, properties: Properties)
        -> Result<()>;

    /// Negotiated session timeout.
    fn session_timeout(&self) -> Duration;

    /// Close the session, removing its ephemeral nodes.
    fn close(&self) -> Result<()>;
}

/// Connector used by the binaries: ZooKeeper when built with the
/// `zookeeper` feature.
pub fn default_connector() -> Arc<dyn Connector> {
    #[cfg(feature = "zookeeper")]
    {
        Arc::new(zookeeper::ZkConnector)
    }
    #[cfg(not(feature = "zookeeper"))]
    {
        Arc::new(Unavailable)
    }
}

#[cfg(not(feature = "zookeeper"))]
struct Unavailable;

#[cfg(not(feature = "zookeeper"))]
impl Connector for Unavailable {
    fn connect(&self, _connection: &str, _session_timeout: Duration) -> Result<Arc<dyn Coordinator>> {
        Err(Error::Unsupported(
            "built without the `zookeeper` feature".into(),
        ))
    }
}

/// Open a session without blocking the async executor.
pub async fn connect(
    connector: Arc<dyn Connector>,
    connection: impl Into<String>,
    session_timeout: Duration,
) -> Result<Arc<dyn Coordinator>> {
    let connection = connection.into();
    crate::common::blocking(move || connector.connect(&connection, session_timeout)).await
}

/// Encode properties as node data.
pub fn encode_properties(properties: &Properties) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(properties)?)
}

/// Decode node data; empty data means no properties.
pub fn decode_properties(data: &[u8]) -> Result<Properties> {
    if data.is_empty() {
        return Ok(Properties::new());
    }
    Ok(serde_json::from_slice(data)?)
}

/// Live set of child names under a registry path, kept sorted.
#[derive(Debug, Clone)]
pub struct Children {
    path: String,
    rx: watch::Receiver<Vec<String>>,
}

impl Children {
    pub fn new(path: impl Into<String>, rx: watch::Receiver<Vec<String>>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current child names.
    pub fn snapshot(&self) -> Vec<String> {
        self.rx.borrow().clone()
    }

    /// Has the session feeding this view gone away?
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Call `callback` with the current names now, then on every change.
    ///
    /// Later calls run on a delivery task; the callback should hand the
    /// snapshot off and return. Delivery stops when the returned
    /// [`ChangeWatch`] is dropped or the session closes.
    pub fn on_change<F>(&self, mut callback: F) -> ChangeWatch
    where
        F: FnMut(&[String]) + Send + 'static,
    {
        let mut rx = self.rx.clone();
        {
            let names = rx.borrow_and_update().clone();
            callback(&names);
        }

        let path = self.path.clone();
        let task = tokio::spawn(
            async move {
                while rx.changed().await.is_ok() {
                    let names = rx.borrow_and_update().clone();
                    callback(&names);
                }
                tracing::debug!("Change delivery for {} stopped", path);
            }
            .instrument(tracing::Span::current()),
        );

        ChangeWatch { task }
    }

    /// Wait until the child set satisfies `predicate`.
    pub async fn wait_until<P>(&self, mut predicate: P) -> Result<Vec<String>>
    where
        P: FnMut(&[String]) -> bool,
    {
        let mut rx = self.rx.clone();
        let names = rx
            .wait_for(|names| predicate(names))
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok((*names).clone())
    }
}

/// Handle on a change subscription; dropping it stops delivery.
#[derive(Debug)]
pub struct ChangeWatch {
    task: JoinHandle<()>,
}

impl ChangeWatch {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ChangeWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
