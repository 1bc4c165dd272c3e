//! Server registration
//!
//! Announces a bound storage server as an ephemeral node
//! `<path>/<host>:<port>` and keeps it there until the session closes. The
//! node carries the server's `pid` and, when a monitor listener is
//! configured, its `monitor` address.

use crate::common::{blocking, retry_with_backoff, Address, Error, Result, ZooKeeperConfig};
use crate::registry::{self, Connector, Coordinator, Properties};
use crate::server::monitor::{Directory, Monitor};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// First delay between connection attempts while waiting for the registry
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Cap for the delay between connection attempts
pub const CONNECT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    AwaitingBind,
    Registering,
    Registered,
    Failed,
    Closed,
}

impl RegistrarState {
    /// No further transitions happen from a final state.
    pub fn is_final(self) -> bool {
        matches!(self, RegistrarState::Failed | RegistrarState::Closed)
    }
}

impl fmt::Display for RegistrarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrarState::AwaitingBind => "awaiting-bind",
            RegistrarState::Registering => "registering",
            RegistrarState::Registered => "registered",
            RegistrarState::Failed => "failed",
            RegistrarState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Where and how to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub connection: String,
    pub path: String,
    pub session_timeout: Duration,
    pub monitor: Option<Address>,
    /// Retry the registry connection until it succeeds, in the background.
    pub wait: bool,
}

impl Registration {
    /// Settings from the `[zookeeper]` section, or `None` if the server runs
    /// unregistered. Without an explicit `wait`, a fixed `listen_port` waits
    /// for the registry and an ephemeral one doesn't.
    pub fn from_config(config: &ZooKeeperConfig, listen_port: u16) -> Result<Option<Self>> {
        config.validate()?;
        let Some((connection, path)) = config.registration() else {
            return Ok(None);
        };

        Ok(Some(Self {
            connection: connection.to_string(),
            path: path.to_string(),
            session_timeout: config.session_timeout(),
            monitor: config.monitor_address()?,
            wait: config.wait.unwrap_or(listen_port != 0),
        }))
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Arc<dyn Coordinator>>,
    monitor: Option<Monitor>,
    /// Address as bound and as advertised
    registered: Option<(Address, Address)>,
    task: Option<JoinHandle<()>>,
}

/// Registers one server address and owns the session that keeps it alive.
pub struct Registrar {
    connector: Arc<dyn Connector>,
    registration: Registration,
    directory: Directory,
    state: watch::Sender<RegistrarState>,
    inner: Mutex<Inner>,
}

impl Registrar {
    pub fn new(connector: Arc<dyn Connector>, registration: Registration) -> Arc<Self> {
        let (state, _) = watch::channel(RegistrarState::AwaitingBind);
        Arc::new(Self {
            connector,
            registration,
            directory: Directory::new(),
            state,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn state(&self) -> RegistrarState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrarState> {
        self.state.subscribe()
    }

    /// Wait until the registrar reaches `target`. Fails if it ends up in a
    /// different final state.
    pub async fn wait_for(&self, target: RegistrarState) -> Result<()> {
        let mut rx = self.state.subscribe();
        let reached = *rx
            .wait_for(|state| *state == target || state.is_final())
            .await
            .map_err(|_| Error::Internal("registrar state dropped".into()))?;

        if reached == target {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "registrar is {} while waiting for {}",
                reached, target
            )))
        }
    }

    /// The advertised address once registered.
    pub fn registered(&self) -> Option<Address> {
        self.inner
            .lock()
            .registered
            .as_ref()
            .map(|(_, advertised)| advertised.clone())
    }

    /// The live registry session, if connected.
    pub fn session(&self) -> Option<Arc<dyn Coordinator>> {
        self.inner.lock().session.clone()
    }

    pub fn monitor_address(&self) -> Option<std::net::SocketAddr> {
        self.inner.lock().monitor.as_ref().map(Monitor::local_addr)
    }

    /// Addresses served by this registrar, as reported by the monitor.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Register `bound` now, returning the advertised address.
    pub async fn register(&self, bound: Address) -> Result<Address> {
        if !self.transition(RegistrarState::Registering) {
            return Err(Error::SessionClosed);
        }

        match self.run(bound).await {
            Ok(advertised) => {
                self.transition(RegistrarState::Registered);
                Ok(advertised)
            }
            Err(e) => {
                tracing::error!(
                    "Registration under {} failed: {}",
                    self.registration.path,
                    e
                );
                self.transition(RegistrarState::Failed);
                self.release().await;
                Err(e)
            }
        }
    }

    /// Start the monitor listener if one is configured and not running yet,
    /// returning the address to advertise for it.
    pub async fn start_monitor(&self) -> Result<Option<Address>> {
        let Some(configured) = &self.registration.monitor else {
            return Ok(None);
        };
        let running = self.inner.lock().monitor.as_ref().map(Monitor::address);
        if running.is_some() {
            return Ok(running);
        }

        let monitor = Monitor::start(configured, self.directory.clone(), self.subscribe()).await?;
        let address = monitor.address();
        let mut slot = Some(monitor);
        if self.keep(|inner| inner.monitor = slot.take()).is_err() {
            if let Some(monitor) = slot {
                monitor.stop().await;
            }
            return Err(Error::SessionClosed);
        }
        Ok(Some(address))
    }

    /// Register `bound` on a background task and return right away.
    pub fn spawn(self: &Arc<Self>, bound: Address) {
        let registrar = self.clone();
        let task = tokio::spawn(
            async move {
                let _ = registrar.register(bound).await;
            }
            .instrument(tracing::Span::current()),
        );
        self.inner.lock().task = Some(task);
    }

    /// Close the session, which removes the node, and stop the monitor.
    pub async fn close(&self) -> Result<()> {
        let (task, session, monitor, registered) = {
            let mut inner = self.inner.lock();
            self.state.send_replace(RegistrarState::Closed);
            (
                inner.task.take(),
                inner.session.take(),
                inner.monitor.take(),
                inner.registered.take(),
            )
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some((bound, _)) = registered {
            self.directory.remove(&self.registration.path, &bound);
        }
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        if let Some(session) = session {
            blocking(move || session.close()).await?;
            tracing::info!(
                "Closed registry session for {}",
                self.registration.path
            );
        }
        Ok(())
    }

    /// Let go of the session and monitor after a failed registration.
    async fn release(&self) {
        let (session, monitor) = {
            let mut inner = self.inner.lock();
            (inner.session.take(), inner.monitor.take())
        };
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        if let Some(session) = session {
            if let Err(e) = blocking(move || session.close()).await {
                tracing::warn!("Can't close registry session: {}", e);
            }
        }
    }

    /// Move to `to` unless already closed.
    fn transition(&self, to: RegistrarState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RegistrarState::Closed {
                return false;
            }
            *state = to;
            true
        });
        self.state() == to
    }

    async fn run(&self, bound: Address) -> Result<Address> {
        let registration = &self.registration;
        let session = self.connect().await?;
        self.keep(|inner| inner.session = Some(session.clone()))?;

        let mut properties = Properties::new();
        properties.insert("pid".into(), std::process::id().into());

        if let Some(monitor) = self.start_monitor().await? {
            properties.insert("monitor".into(), monitor.to_string().into());
        }

        let advertised = advertised_address(&bound);
        let path = registration.path.clone();
        let node = advertised.clone();
        blocking(move || session.register_server(&path, &node, properties)).await?;

        self.keep(|inner| {
            self.directory.insert(&registration.path, bound.clone());
            inner.registered = Some((bound.clone(), advertised.clone()));
        })?;
        tracing::info!("Registered {} under {}", advertised, registration.path);
        Ok(advertised)
    }

    async fn connect(&self) -> Result<Arc<dyn Coordinator>> {
        let registration = &self.registration;
        if !registration.wait {
            return registry::connect(
                self.connector.clone(),
                registration.connection.as_str(),
                registration.session_timeout,
            )
            .await;
        }

        let connector = self.connector.clone();
        let connection = registration.connection.clone();
        let timeout = registration.session_timeout;
        retry_with_backoff(
            move || registry::connect(connector.clone(), connection.clone(), timeout),
            None,
            CONNECT_RETRY_DELAY,
            CONNECT_RETRY_MAX_DELAY,
        )
        .await
    }

    /// Apply `f` under the lock unless the registrar was closed meanwhile.
    fn keep<F: FnOnce(&mut Inner)>(&self, f: F) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.state() == RegistrarState::Closed {
            return Err(Error::SessionClosed);
        }
        f(&mut inner);
        Ok(())
    }
}

/// Replace a wildcard host with this machine's address.
pub fn advertised_address(bound: &Address) -> Address {
    if !bound.is_unspecified() {
        return bound.clone();
    }
    match local_ip_address::local_ip() {
        Ok(ip) => Address::new(ip.to_string(), bound.port),
        Err(e) => {
            tracing::warn!("Couldn't determine local address ({}), registering 127.0.0.1", e);
            Address::new("127.0.0.1", bound.port)
        }
    }
}
