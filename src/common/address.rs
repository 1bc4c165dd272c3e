//! Server addresses as stored in registry node names

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A `(host, port)` pair parsed from a `host:port` node name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a node name. The port is mandatory; the host may be empty.
    pub fn parse(name: &str) -> Result<Self> {
        let (host, port) = name
            .rsplit_once(':')
            .ok_or_else(|| Error::MalformedAddress(name.to_string()))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| Error::MalformedAddress(name.to_string()))?,
            // An unbracketed host must not contain further colons.
            None if host.contains(':') => return Err(Error::MalformedAddress(name.to_string())),
            None => host,
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| Error::MalformedAddress(name.to_string()))?;

        Ok(Self::new(host, port))
    }

    /// Parse a bind address where the port may be omitted (`host`, `host:`,
    /// `:port`, `host:port`). A missing port means "let the OS pick".
    pub fn parse_bind(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(Self::new("", 0));
        }
        if value.parse::<std::net::Ipv6Addr>().is_ok() {
            return Ok(Self::new(value, 0));
        }
        if let Ok(addr) = Self::parse(value) {
            return Ok(addr);
        }
        match value.strip_suffix(':') {
            Some(host) if !host.contains(':') => Ok(Self::new(host, 0)),
            None if !value.contains(':') => Ok(Self::new(value, 0)),
            _ => Err(Error::MalformedAddress(value.to_string())),
        }
    }

    /// Is the host a wildcard (empty, `0.0.0.0` or `::`)?
    pub fn is_unspecified(&self) -> bool {
        self.host.is_empty()
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_unspecified())
                .unwrap_or(false)
    }

    /// Host to hand to the socket layer; an empty host binds every interface.
    pub fn bind_host(&self) -> &str {
        if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Parse every node name, failing on the first malformed one.
pub fn parse_addresses<S: AsRef<str>>(names: &[S]) -> Result<Vec<Address>> {
    names.iter().map(|name| Address::parse(name.as_ref())).collect()
}
