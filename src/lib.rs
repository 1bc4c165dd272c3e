//! # zkzeo
//!
//! Glue between storage servers/clients and a ZooKeeper service registry:
//! - servers register their bound address as an ephemeral node
//! - clients resolve a registry path into a live address list
//! - address changes are pushed into running clients
//! - an optional monitor listener and a Nagios-style check
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              │     ZooKeeper ensemble       │
//!              │  /databases/demo             │
//!              │    ├─ 10.0.0.1:8100 (ephem.) │
//!              │    └─ 10.0.0.2:8100 (ephem.) │
//!              └──────▲───────────────┬───────┘
//!           register  │               │ children + watch
//!   ┌─────────────────┴───┐     ┌─────▼────────────────┐
//!   │ zkzeo-server        │     │ zkzeo client         │
//!   │  bind → port → reg. │◄────┤  wait → bind → watch │
//!   │  + monitor listener │ TCP │  → new_addresses     │
//!   └─────────────────────┘     └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a registered server
//! ```bash
//! zkzeo-server \
//!   --address :0 \
//!   --zookeeper zk1:2181,zk2:2181 \
//!   --path /databases/demo \
//!   --monitor-server 127.0.0.1
//! ```
//!
//! ### Check it
//! ```bash
//! zkzeo-check zk1:2181 /databases/demo -M 127.0.0.1:9000
//! ```
//!
//! ### Open a client
//! ```rust,no_run
//! # async fn demo(connector: std::sync::Arc<dyn zkzeo::registry::Connector>) -> zkzeo::Result<()> {
//! let config = zkzeo::ClientConfig::new("zk1:2181", "/databases/demo");
//! let client = zkzeo::client::client(connector, &config).await?;
//! println!("servers: {:?}", client.addresses());
//! # Ok(())
//! # }
//! ```

pub mod check;
pub mod client;
pub mod common;
pub mod registry;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use client::ZkClient;
pub use common::{Address, ClientConfig, Config, Error, Result};
pub use registry::{Connector, Coordinator, MemoryRegistry};
pub use server::{Registrar, RegistrarState, ZkServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
