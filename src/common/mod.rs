//! Common utilities and types shared across zkzeo

pub mod address;
pub mod config;
pub mod error;
pub mod utils;

pub use address::{parse_addresses, Address};
pub use config::{ClientConfig, Config, ServerConfig, ZooKeeperConfig};
pub use error::{Error, Result};
pub use utils::{blocking, parse_duration, retry_with_backoff};
