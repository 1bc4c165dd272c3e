//! In-memory registry
//!
//! Behaves like a small ZooKeeper ensemble: persistent paths, ephemeral
//! children owned by sessions, and child watches. A registry only accepts
//! connections on the connection strings it was told to serve, so tests can
//! model an unreachable ensemble and one that comes up later.

use crate::common::{Address, Error, Result};
use crate::registry::{decode_properties, encode_properties, Children, Connector, Coordinator, Properties};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: u64,
}

#[derive(Debug, Default)]
struct PathEntry {
    children: BTreeMap<String, Node>,
    /// One feed per `children()` call, tagged with the owning session
    watchers: Vec<(u64, watch::Sender<Vec<String>>)>,
}

impl PathEntry {
    fn names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    fn watch(&mut self, session: u64) -> watch::Receiver<Vec<String>> {
        let (tx, rx) = watch::channel(self.names());
        self.watchers.push((session, tx));
        rx
    }

    fn publish(&mut self) {
        let names = self.names();
        self.watchers.retain(|(_, tx)| !tx.is_closed());
        for (_, tx) in &self.watchers {
            tx.send_replace(names.clone());
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    serving: BTreeSet<String>,
    paths: BTreeMap<String, PathEntry>,
    live_sessions: BTreeSet<u64>,
    next_session: u64,
}

impl Inner {
    fn drop_session(&mut self, session: u64) {
        if !self.live_sessions.remove(&session) {
            return;
        }
        for entry in self.paths.values_mut() {
            // Watches die with their session.
            entry.watchers.retain(|(owner, _)| *owner != session);
            let before = entry.children.len();
            entry.children.retain(|_, node| node.owner != session);
            if entry.children.len() != before {
                entry.publish();
            }
        }
    }
}

/// Shared in-memory registry; clones refer to the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry reachable at `connection` with `paths` already created.
    pub fn serving(connection: &str, paths: &[&str]) -> Self {
        let registry = Self::new();
        registry.serve(connection);
        for path in paths {
            registry.create_path(path);
        }
        registry
    }

    /// Start accepting sessions on `connection`.
    pub fn serve(&self, connection: &str) {
        self.inner.lock().serving.insert(connection.to_string());
    }

    /// Create a persistent path and its parents.
    pub fn create_path(&self, path: &str) {
        let mut inner = self.inner.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            inner.paths.entry(current.clone()).or_default();
        }
    }

    /// Child names and decoded properties under `path`.
    pub fn nodes(&self, path: &str) -> Result<Vec<(String, Properties)>> {
        let inner = self.inner.lock();
        let entry = inner
            .paths
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        entry
            .children
            .iter()
            .map(|(name, node)| Ok((name.clone(), decode_properties(&node.data)?)))
            .collect()
    }

    /// Create a child node outside of any session, as a foreign writer would.
    pub fn add_child(&self, path: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .paths
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        entry.children.insert(
            name.to_string(),
            Node {
                data: Vec::new(),
                owner: 0,
            },
        );
        entry.publish();
        Ok(())
    }

    /// Remove a child node.
    pub fn remove_child(&self, path: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .paths
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if entry.children.remove(name).is_some() {
            entry.publish();
        }
        Ok(())
    }

    /// Expire every live session, as a partitioned ensemble would.
    pub fn expire_sessions(&self) {
        let mut inner = self.inner.lock();
        let sessions: Vec<u64> = inner.live_sessions.iter().copied().collect();
        for session in sessions {
            inner.drop_session(session);
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().live_sessions.len()
    }
}

impl Connector for MemoryRegistry {
    fn connect(&self, connection: &str, session_timeout: Duration) -> Result<Arc<dyn Coordinator>> {
        let mut inner = self.inner.lock();
        if !inner.serving.contains(connection) {
            return Err(Error::FailedConnect(connection.to_string()));
        }
        inner.next_session += 1;
        let id = inner.next_session;
        inner.live_sessions.insert(id);
        tracing::debug!("Opened session {} on {}", id, connection);

        Ok(Arc::new(MemorySession {
            registry: self.clone(),
            id,
            session_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session on a [`MemoryRegistry`].
#[derive(Debug)]
pub struct MemorySession {
    registry: MemoryRegistry,
    id: u64,
    session_timeout: Duration,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_live(&self, inner: &Inner) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || !inner.live_sessions.contains(&self.id) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }
}

impl Coordinator for MemorySession {
    fn children(&self, path: &str) -> Result<Children> {
        let mut inner = self.registry.inner.lock();
        self.ensure_live(&inner)?;
        let entry = inner
            .paths
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        Ok(Children::new(path, entry.watch(self.id)))
    }

    fn register_server(&self, path: &str, address: &Address, properties: Properties) -> Result<()> {
        let data = encode_properties(&properties)?;
        let mut inner = self.registry.inner.lock();
        self.ensure_live(&inner)?;
        let entry = inner
            .paths
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;

        let name = address.to_string();
        if entry.children.contains_key(&name) {
            return Err(Error::NodeExists(format!("{}/{}", path, name)));
        }
        entry.children.insert(
            name,
            Node {
                data,
                owner: self.id,
            },
        );
        entry.publish();
        Ok(())
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.registry.inner.lock().drop_session(self.id);
        tracing::debug!("Closed session {}", self.id);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZK: &str = "zookeeper.example.com:2181";

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_connect_requires_serving_ensemble() {
        let registry = MemoryRegistry::new();
        let err = registry
            .connect("192.0.2.42:2181", Duration::from_secs(1))
            .err().unwrap();
        assert!(matches!(err, Error::FailedConnect(ref c) if c == "192.0.2.42:2181"));

        registry.serve("192.0.2.42:2181");
        assert!(registry.connect("192.0.2.42:2181", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_session_timeout_is_kept() {
        let registry = MemoryRegistry::serving(ZK, &[]);
        let session = registry.connect(ZK, Duration::from_millis(4242)).unwrap();
        assert_eq!(session.session_timeout(), Duration::from_millis(4242));
    }

    #[test]
    fn test_register_and_close_removes_ephemeral_node() {
        let registry = MemoryRegistry::serving(ZK, &["/databases/demo"]);
        let server = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        let client = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        let children = client.children("/databases/demo").unwrap();
        assert!(children.snapshot().is_empty());

        server
            .register_server(
                "/databases/demo",
                &Address::new("127.0.0.1", 8100),
                props(&[("monitor", "127.0.0.1:9000")]),
            )
            .unwrap();
        assert_eq!(children.snapshot(), vec!["127.0.0.1:8100"]);

        let nodes = registry.nodes("/databases/demo").unwrap();
        assert_eq!(nodes[0].1["monitor"], "127.0.0.1:9000");

        server.close().unwrap();
        assert!(children.snapshot().is_empty());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = MemoryRegistry::serving(ZK, &["/demo"]);
        let session = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        let addr = Address::new("127.0.0.1", 8100);
        session.register_server("/demo", &addr, Properties::new()).unwrap();
        assert!(matches!(
            session.register_server("/demo", &addr, Properties::new()),
            Err(Error::NodeExists(_))
        ));
    }

    #[test]
    fn test_missing_path() {
        let registry = MemoryRegistry::serving(ZK, &["/databases"]);
        let session = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        assert!(matches!(session.children("/nope"), Err(Error::NoNode(_))));
        assert!(session.children("/databases").is_ok());
    }

    #[test]
    fn test_expired_session_cannot_register() {
        let registry = MemoryRegistry::serving(ZK, &["/demo"]);
        let session = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        session
            .register_server("/demo", &Address::new("h", 1), Properties::new())
            .unwrap();

        registry.expire_sessions();
        assert!(registry.nodes("/demo").unwrap().is_empty());
        assert!(matches!(
            session.register_server("/demo", &Address::new("h", 2), Properties::new()),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn test_foreign_children() {
        let registry = MemoryRegistry::serving(ZK, &["/demo"]);
        let session = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        let children = session.children("/demo").unwrap();

        registry.add_child("/demo", "10.0.0.2:200").unwrap();
        registry.add_child("/demo", "10.0.0.1:100").unwrap();
        assert_eq!(children.snapshot(), vec!["10.0.0.1:100", "10.0.0.2:200"]);

        registry.remove_child("/demo", "10.0.0.2:200").unwrap();
        assert_eq!(children.snapshot(), vec!["10.0.0.1:100"]);
    }

    #[test]
    fn test_close_ends_child_views() {
        let registry = MemoryRegistry::serving(ZK, &["/demo"]);
        let session = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        let other = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        let children = session.children("/demo").unwrap();
        let others = other.children("/demo").unwrap();
        assert!(!children.is_closed());

        session.close().unwrap();
        assert!(children.is_closed());
        assert!(!others.is_closed());

        registry.add_child("/demo", "10.0.0.1:100").unwrap();
        assert!(children.snapshot().is_empty());
        assert_eq!(others.snapshot(), vec!["10.0.0.1:100"]);
    }

    #[test]
    fn test_expiry_ends_child_views() {
        let registry = MemoryRegistry::serving(ZK, &["/demo"]);
        let session = registry.connect(ZK, Duration::from_secs(1)).unwrap();
        let children = session.children("/demo").unwrap();

        registry.expire_sessions();
        assert!(children.is_closed());
    }
}
