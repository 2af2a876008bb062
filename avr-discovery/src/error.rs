//! Error types for the discovery system.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Error type for discovery operations.
///
/// Discovery is best-effort: none of these are fatal to a session. A failed
/// hostname lookup is reported once, and a failed multicast join is retried by
/// the beacon listener until it succeeds.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Socket creation, bind or receive failed
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// DNS lookup for a configured hostname failed
    #[error("Failed to resolve {hostname}: {source}")]
    Resolve {
        hostname: String,
        #[source]
        source: io::Error,
    },

    /// DNS lookup succeeded but produced no IPv4 address
    #[error("No IPv4 address found for {0}")]
    NoAddress(String),

    /// Joining the beacon multicast group failed
    #[error("Failed to join multicast group {group}: {source}")]
    MulticastJoin {
        group: Ipv4Addr,
        #[source]
        source: io::Error,
    },
}

/// Convenience Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_join_names_group() {
        let error = DiscoveryError::MulticastJoin {
            group: Ipv4Addr::new(239, 255, 250, 250),
            source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no route"),
        };
        assert_eq!(
            error.to_string(),
            "Failed to join multicast group 239.255.250.250: no route"
        );
        assert!(std::error::Error::source(&error).is_some());
    }
}
