//! Startup wait for registered addresses
//!
//! Plain polling: the loop re-reads the live child set on a short interval
//! until it is non-empty. Flapping between empty and non-empty needs no extra
//! bookkeeping this way.

use crate::common::{parse_addresses, Address, Error, Result};
use crate::registry::Children;
use std::time::Duration;

/// Delay between two reads of an empty address set.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Empty polls between two "No addresses" warnings (about five minutes).
pub const WARN_EVERY_POLLS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    pub warn_every_polls: u64,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            warn_every_polls: WARN_EVERY_POLLS,
        }
    }
}

/// Resolve the addresses in `children`.
///
/// With `wait`, blocks until at least one address is registered. There is no
/// timeout; wrap the call in `tokio::time::timeout` for a bounded wait.
/// Closing the registry session ends the wait with [`Error::SessionClosed`].
pub async fn wait_for_addresses(
    children: &Children,
    target: &str,
    wait: bool,
    options: WaitOptions,
) -> Result<Vec<Address>> {
    let warn_every = options.warn_every_polls.max(1);
    let mut polls: u64 = 0;

    loop {
        let addresses = parse_addresses(&children.snapshot())?;
        if !addresses.is_empty() {
            if polls > 0 {
                tracing::warn!("OK: Got addresses from <{}>", target);
            }
            return Ok(addresses);
        }
        if !wait {
            return Ok(addresses);
        }
        if children.is_closed() {
            return Err(Error::SessionClosed);
        }
        if polls % warn_every == 0 {
            tracing::warn!("No addresses from <{}>", target);
        }
        tokio::time::sleep(options.poll_interval).await;
        polls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connector, MemoryRegistry};
    use std::time::Instant;
    use tokio::sync::watch;
    use tracing_test::traced_test;

    const TARGET: &str = "zookeeper.example.com:2181/databases/demo";

    fn children(names: &[&str]) -> (watch::Sender<Vec<String>>, Children) {
        let (tx, rx) = watch::channel(names.iter().map(|n| n.to_string()).collect());
        (tx, Children::new("/databases/demo", rx))
    }

    #[tokio::test]
    #[traced_test]
    async fn test_non_empty_returns_on_first_poll() {
        let (_tx, children) = children(&["10.0.0.1:100"]);
        let started = Instant::now();
        let addresses = wait_for_addresses(&children, TARGET, true, WaitOptions::default())
            .await
            .unwrap();

        assert_eq!(addresses, vec![Address::new("10.0.0.1", 100)]);
        assert!(started.elapsed() < POLL_INTERVAL * 5);
        assert!(!logs_contain("No addresses"));
        assert!(!logs_contain("OK: Got addresses"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_waits_until_address_appears() {
        let (tx, children) = children(&[]);
        let started = Instant::now();

        let (addresses, published_at) = tokio::join!(
            wait_for_addresses(&children, TARGET, true, WaitOptions::default()),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                tx.send_replace(vec!["127.0.0.1:9999".to_string()]);
                Instant::now()
            }
        );

        let resolved_at = Instant::now();
        assert_eq!(addresses.unwrap(), vec![Address::new("127.0.0.1", 9999)]);
        assert!(resolved_at.duration_since(started) >= Duration::from_millis(100));
        assert!(resolved_at.duration_since(published_at) < Duration::from_millis(500));
        assert!(logs_contain(
            "No addresses from <zookeeper.example.com:2181/databases/demo>"
        ));
        assert!(logs_contain(
            "OK: Got addresses from <zookeeper.example.com:2181/databases/demo>"
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_no_wait_returns_empty_immediately() {
        let (_tx, children) = children(&[]);
        let options = WaitOptions {
            poll_interval: Duration::from_secs(60),
            ..WaitOptions::default()
        };

        let addresses = tokio::time::timeout(
            Duration::from_millis(500),
            wait_for_addresses(&children, TARGET, false, options),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(addresses.is_empty());
        assert!(!logs_contain("No addresses"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_warns_periodically() {
        let (tx, children) = children(&[]);
        let options = WaitOptions {
            poll_interval: Duration::from_millis(1),
            warn_every_polls: 3,
        };

        let (addresses, _) = tokio::join!(
            wait_for_addresses(&children, TARGET, true, options),
            async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                tx.send_replace(vec!["h:1".to_string()]);
            }
        );
        assert_eq!(addresses.unwrap(), vec![Address::new("h", 1)]);

        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| {
                    line.contains("No addresses from <zookeeper.example.com:2181/databases/demo>")
                })
                .count();
            if warnings >= 2 {
                Ok(())
            } else {
                Err(format!("expected repeated warnings, got {}", warnings))
            }
        });
    }

    #[tokio::test]
    async fn test_malformed_name_fails_loudly() {
        let (_tx, children) = children(&["not-an-address"]);
        let err = wait_for_addresses(&children, TARGET, true, WaitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedAddress(_)));
    }

    #[tokio::test]
    async fn test_closed_session_ends_wait() {
        let (tx, children) = children(&[]);
        drop(tx);
        let err = wait_for_addresses(&children, TARGET, true, WaitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }

    #[tokio::test]
    async fn test_closing_session_ends_pending_wait() {
        let registry = MemoryRegistry::serving("zookeeper.example.com:2181", &["/databases/demo"]);
        let session = registry
            .connect("zookeeper.example.com:2181", Duration::from_secs(1))
            .unwrap();
        let children = session.children("/databases/demo").unwrap();

        let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                wait_for_addresses(&children, TARGET, true, WaitOptions::default()),
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    session.close().unwrap();
                }
            )
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::SessionClosed)));
        assert_eq!(registry.session_count(), 0);
    }
}
