//! Configuration for zkzeo components

use crate::common::{Address, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `ZKZEO__ZOOKEEPER__PATH`.
pub const ENV_PREFIX: &str = "ZKZEO";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage server section
    #[serde(default)]
    pub server: ServerConfig,

    /// Registration section; every key is optional
    #[serde(default)]
    pub zookeeper: ZooKeeperConfig,

    /// Client section
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Address::parse_bind(&self.server.address)?;
        self.zookeeper.validate()?;
        if let Some(client) = &self.client {
            client.validate()?;
        }
        Ok(())
    }
}

/// Storage server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address; a missing or zero port picks an ephemeral one
    #[serde(default = "default_server_address")]
    pub address: String,
}

fn default_server_address() -> String {
    "127.0.0.1:0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

/// Registry configuration for a server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZooKeeperConfig {
    /// Connection string (`host:port[,host:port...]`)
    pub connection: Option<String>,

    /// Path to register under
    pub path: Option<String>,

    /// Session timeout in milliseconds
    pub session_timeout_ms: Option<u64>,

    /// Monitor listener address; the port may be omitted
    pub monitor_server: Option<String>,

    /// Wait for the registry in the background instead of failing startup.
    /// Defaults to waiting unless the listen port is ephemeral.
    pub wait: Option<bool>,
}

/// Default session timeout
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

impl ZooKeeperConfig {
    /// Connection string and path, when both are set.
    pub fn registration(&self) -> Option<(&str, &str)> {
        match (&self.connection, &self.path) {
            (Some(connection), Some(path)) => Some((connection.as_str(), path.as_str())),
            _ => None,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn monitor_address(&self) -> Result<Option<Address>> {
        self.monitor_server
            .as_deref()
            .map(Address::parse_bind)
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.path {
            validate_path(path)?;
        }
        self.monitor_address()?;
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection string of the registry
    pub zookeeper: String,

    /// Registry path the servers are registered under
    pub server: String,

    /// Block until at least one address is registered
    #[serde(default = "default_wait", alias = "wait_for_server_on_startup")]
    pub wait: bool,

    /// Upper bound for the reconnect poll, in seconds
    #[serde(default = "default_max_disconnect_poll")]
    pub max_disconnect_poll: u64,

    /// Session timeout in milliseconds
    pub session_timeout_ms: Option<u64>,
}

fn default_wait() -> bool {
    true
}
fn default_max_disconnect_poll() -> u64 {
    60
}

impl ClientConfig {
    pub fn new(zookeeper: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            zookeeper: zookeeper.into(),
            server: server.into(),
            wait: default_wait(),
            max_disconnect_poll: default_max_disconnect_poll(),
            session_timeout_ms: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.contains(',') || self.server.split_whitespace().count() > 1 {
            return Err(Error::InvalidConfig(
                "Only one server option is allowed".into(),
            ));
        }
        validate_path(&self.server)
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn max_disconnect_poll(&self) -> Duration {
        Duration::from_secs(self.max_disconnect_poll.max(1))
    }
}

/// A registry path must be absolute.
pub fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidConfig(format!(
            "server must be a ZooKeeper path, {:?}",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
            log_level = "debug"

            [server]
            address = "127.0.0.1:8100"

            [zookeeper]
            connection = "zookeeper.example.com:2181"
            path = "/databases/demo"
            session_timeout_ms = 4242
            monitor_server = "127.0.0.1"

            [client]
            zookeeper = "zookeeper.example.com:2181"
            server = "/databases/demo"
            wait = false
            max_disconnect_poll = 1
            "#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.server.address, "127.0.0.1:8100");
        assert_eq!(
            config.zookeeper.registration(),
            Some(("zookeeper.example.com:2181", "/databases/demo"))
        );
        assert_eq!(
            config.zookeeper.session_timeout(),
            Duration::from_millis(4242)
        );
        assert_eq!(
            config.zookeeper.monitor_address().unwrap(),
            Some(Address::new("127.0.0.1", 0))
        );

        let client = config.client.unwrap();
        assert!(!client.wait);
        assert_eq!(client.max_disconnect_poll(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_zookeeper_section() {
        let file = write_config(
            r#"
            [server]
            address = ":"

            [zookeeper]
            "#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.zookeeper, ZooKeeperConfig::default());
        assert_eq!(config.zookeeper.registration(), None);
        assert_eq!(config.zookeeper.session_timeout(), DEFAULT_SESSION_TIMEOUT);
    }

    #[test]
    fn test_client_wait_alias() {
        let file = write_config(
            r#"
            [client]
            zookeeper = "zk:2181"
            server = "/databases/demo"
            wait_for_server_on_startup = false
            "#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert!(!config.client.unwrap().wait);
    }

    #[test]
    fn test_client_path_must_be_absolute() {
        let client = ClientConfig::new("zk:2181", "databases/demo");
        let err = client.validate().unwrap_err();
        assert!(err.to_string().contains("server must be a ZooKeeper path"));

        let client = ClientConfig::new("zk:2181", "/a, /b");
        assert!(client.validate().is_err());

        assert!(ClientConfig::new("zk:2181", "/databases/demo")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_invalid_server_address() {
        let file = write_config(
            r#"
            [server]
            address = "a:b:c"
            "#,
        );
        assert!(Config::load(Some(file.path())).is_err());
    }
}
