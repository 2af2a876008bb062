//! One-shot hostname discovery.
//!
//! Receivers usually advertise an mDNS name such as `denon-avr-x2400h.local`.
//! A single lookup is performed; failure is reported once and never retried.

use std::net::IpAddr;

use tokio::net::lookup_host;
use tokio::task::JoinHandle;

use crate::error::{DiscoveryError, Result};
use crate::DiscoveryRecord;

/// Resolve `hostname` to its first IPv4 address.
pub async fn resolve_hostname(hostname: &str, port: u16) -> Result<IpAddr> {
    let addrs = lookup_host((hostname, port))
        .await
        .map_err(|source| DiscoveryError::Resolve {
            hostname: hostname.to_string(),
            source,
        })?;

    addrs
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| DiscoveryError::NoAddress(hostname.to_string()))
}

/// Resolve `hostname` on a new task and report the outcome once.
///
/// On success the record carries a single `Hostname` attribute.
pub fn spawn_hostname_discovery<F>(hostname: String, port: u16, on_result: F) -> JoinHandle<()>
where
    F: FnOnce(Result<DiscoveryRecord>) + Send + 'static,
{
    tokio::spawn(async move {
        let result = resolve_hostname(&hostname, port).await.map(|address| {
            tracing::debug!("Resolved {} to {}", hostname, address);
            DiscoveryRecord::from_hostname(address, &hostname)
        });
        on_result(result);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ipv4_literal() {
        let address = resolve_hostname("192.168.1.50", 23).await.unwrap();
        assert_eq!(address, "192.168.1.50".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_ipv6_only_has_no_address() {
        let err = resolve_hostname("::1", 23).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NoAddress(ref host) if host == "::1"));
    }

    #[tokio::test]
    async fn test_spawned_lookup_reports_once() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawn_hostname_discovery("10.0.0.5".to_string(), 23, move |result| {
            let _ = tx.send(result);
        })
        .await
        .unwrap();

        let record = rx.await.unwrap().unwrap();
        assert_eq!(record.address, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(record.info["Hostname"], "10.0.0.5");
        assert_eq!(record.source, crate::DiscoverySource::Hostname);
    }
}
