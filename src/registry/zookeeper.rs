//! ZooKeeper backend
//!
//! Child watches in ZooKeeper fire once; every watch event re-reads the
//! children and re-arms the watch. Re-arming happens on a short-lived thread
//! so the client's event thread is never blocked on a request. Closing the
//! session drops every feed, which ends the views built on them.

use crate::common::{Address, Error, Result};
use crate::registry::{encode_properties, Children, Connector, Coordinator, Properties};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use zookeeper::{Acl, CreateMode, WatchedEvent, ZkError, ZooKeeper};

/// Connects to a ZooKeeper ensemble.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZkConnector;

impl Connector for ZkConnector {
    fn connect(&self, connection: &str, session_timeout: Duration) -> Result<Arc<dyn Coordinator>> {
        let zk = ZooKeeper::connect(connection, session_timeout, |event: WatchedEvent| {
            tracing::debug!("ZooKeeper session event: {:?}", event.keeper_state);
        })
        .map_err(|e| {
            tracing::debug!("ZooKeeper connect to {} failed: {}", connection, e);
            Error::FailedConnect(connection.to_string())
        })?;

        // The handshake is asynchronous; a round trip proves the session.
        zk.exists("/", false)
            .map_err(|_| Error::FailedConnect(connection.to_string()))?;

        tracing::info!("Connected to ZooKeeper at {}", connection);
        Ok(Arc::new(ZkSession {
            zk: Arc::new(zk),
            session_timeout,
            feeds: Mutex::new(Vec::new()),
        }))
    }
}

/// Sender behind one child view; `None` once the session let go of it.
type Feed = Arc<Mutex<Option<watch::Sender<Vec<String>>>>>;

/// A ZooKeeper session.
pub struct ZkSession {
    zk: Arc<ZooKeeper>,
    session_timeout: Duration,
    feeds: Mutex<Vec<Feed>>,
}

impl Coordinator for ZkSession {
    fn children(&self, path: &str) -> Result<Children> {
        let (tx, rx) = watch::channel(Vec::new());
        let feed: Feed = Arc::new(Mutex::new(Some(tx)));
        watch_children(&self.zk, path.to_string(), feed.clone()).map_err(|e| map_error(e, path))?;

        let mut feeds = self.feeds.lock();
        feeds.retain(is_open);
        feeds.push(feed);
        Ok(Children::new(path, rx))
    }

    fn register_server(&self, path: &str, address: &Address, properties: Properties) -> Result<()> {
        let node = format!("{}/{}", path, address);
        let data = encode_properties(&properties)?;
        self.zk
            .create(&node, data, Acl::open_unsafe().clone(), CreateMode::Ephemeral)
            .map_err(|e| map_error(e, &node))?;
        tracing::debug!("Created ephemeral node {}", node);
        Ok(())
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    fn close(&self) -> Result<()> {
        for feed in self.feeds.lock().drain(..) {
            feed.lock().take();
        }
        self.zk
            .close()
            .map_err(|e| Error::Coordination(e.to_string()))
    }
}

/// Read the children of `path`, publish them, and leave a watch that repeats
/// this on the next change. Stops once the feed is dropped or every receiver
/// is gone.
fn watch_children(zk: &Arc<ZooKeeper>, path: String, feed: Feed) -> std::result::Result<(), ZkError> {
    let weak: Weak<ZooKeeper> = Arc::downgrade(zk);
    let rearm_path = path.clone();
    let rearm_feed = feed.clone();

    let mut names = zk.get_children_w(&path, move |_event: WatchedEvent| {
        if !is_open(&rearm_feed) {
            return;
        }
        std::thread::spawn(move || {
            let Some(zk) = weak.upgrade() else {
                rearm_feed.lock().take();
                return;
            };
            if let Err(e) = watch_children(&zk, rearm_path.clone(), rearm_feed.clone()) {
                tracing::warn!("Lost child watch on {}: {}", rearm_path, e);
                rearm_feed.lock().take();
            }
        });
    })?;

    names.sort();
    if let Some(tx) = feed.lock().as_ref() {
        tx.send_replace(names);
    }
    Ok(())
}

fn is_open(feed: &Feed) -> bool {
    feed.lock().as_ref().is_some_and(|tx| !tx.is_closed())
}

fn map_error(e: ZkError, path: &str) -> Error {
    match e {
        ZkError::NoNode => Error::NoNode(path.to_string()),
        ZkError::NodeExists => Error::NodeExists(path.to_string()),
        ZkError::SessionExpired => Error::SessionClosed,
        other => Error::Coordination(format!("{}: {}", path, other)),
    }
}
