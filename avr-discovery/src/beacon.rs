//! AMX Device Discovery beacon listener
//!
//! AMX-compatible devices multicast a short ASCII frame that starts with the
//! magic `AMXB` followed by tagged fields:
//!
//! ```text
//! AMXB<-SDKClass=Receiver><-Make=DENON><-Model=AVR-X2400H>...
//! ```
//!
//! The listener joins the beacon group, drops anything without the magic, and
//! reports the sender address with the parsed fields for every frame it sees.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::{DiscoveryError, Result};
use crate::DiscoveryRecord;

/// Multicast group AMX beacons are sent to
pub const BEACON_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 250, 250);

/// UDP port AMX beacons are sent to
pub const BEACON_PORT: u16 = 9131;

/// Four-byte header every beacon frame starts with
pub const BEACON_MAGIC: &[u8; 4] = b"AMXB";

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<-([^=]+)=([^>]+)>").expect("beacon tag pattern is valid"));

/// Parse a beacon datagram into its tagged fields.
///
/// Returns `None` when the datagram does not start with [`BEACON_MAGIC`].
/// Tags are matched left to right without overlap; a frame with the magic but
/// no tags yields an empty map.
pub fn parse_beacon(datagram: &[u8]) -> Option<BTreeMap<String, String>> {
    if datagram.get(..BEACON_MAGIC.len()) != Some(BEACON_MAGIC.as_slice()) {
        return None;
    }

    let text = String::from_utf8_lossy(datagram);
    Some(
        TAG_PATTERN
            .captures_iter(&text)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
            .collect(),
    )
}

/// Configuration for the beacon listener
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Multicast group to join
    /// Default: 239.255.250.250
    pub group: Ipv4Addr,

    /// Local port to bind
    /// Default: 9131
    pub port: u16,

    /// Delay between attempts to join the multicast group
    /// Default: 5 seconds
    pub join_retry_interval: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            group: BEACON_GROUP,
            port: BEACON_PORT,
            join_retry_interval: Duration::from_secs(5),
        }
    }
}

impl BeaconConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_join_retry_interval(mut self, interval: Duration) -> Self {
        self.join_retry_interval = interval;
        self
    }
}

/// Listens for AMX beacons on a bound UDP socket.
pub struct BeaconListener {
    socket: UdpSocket,
    config: BeaconConfig,
}

impl BeaconListener {
    /// Bind the beacon socket.
    ///
    /// Must be called from within a tokio runtime. Joining the multicast
    /// group happens later, in [`run`](Self::run), and is retried until it
    /// succeeds, so binding works even before a network interface is up.
    pub fn bind(config: BeaconConfig) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            config.port,
        )))?;
        socket.set_multicast_loop_v4(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self { socket, config })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Join the multicast group, retrying forever on failure.
    async fn join_group(&self) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self
                .socket
                .join_multicast_v4(self.config.group, Ipv4Addr::UNSPECIFIED)
            {
                Ok(()) => {
                    tracing::info!(
                        "Joined beacon group {} after {} attempt(s)",
                        self.config.group,
                        attempts
                    );
                    return;
                }
                Err(source) => {
                    let error = DiscoveryError::MulticastJoin {
                        group: self.config.group,
                        source,
                    };
                    tracing::warn!("{}; retrying in {:?}", error, self.config.join_retry_interval);
                    tokio::time::sleep(self.config.join_retry_interval).await;
                }
            }
        }
    }

    /// Receive beacons forever, calling `on_found` once per valid frame.
    ///
    /// The group join runs concurrently with reception, so unicast beacons
    /// are delivered even while the join is still being retried.
    pub async fn run<F>(self, mut on_found: F)
    where
        F: FnMut(DiscoveryRecord),
    {
        let mut buffer = [0u8; 2048];
        let join = self.join_group();
        tokio::pin!(join);
        let mut joined = false;

        loop {
            tokio::select! {
                () = &mut join, if !joined => {
                    joined = true;
                }
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, from)) => match parse_beacon(&buffer[..len]) {
                            Some(info) => {
                                tracing::debug!("Beacon from {}: {:?}", from.ip(), info);
                                on_found(DiscoveryRecord::new(from.ip(), info));
                            }
                            None => {
                                tracing::trace!("Ignoring non-AMXB datagram from {}", from);
                            }
                        },
                        Err(e) => {
                            tracing::warn!("Beacon socket receive failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Bind a beacon listener and run it on a new task.
///
/// The task never finishes on its own; abort the returned handle to stop it.
pub fn spawn_beacon_discovery<F>(config: BeaconConfig, on_found: F) -> Result<JoinHandle<()>>
where
    F: FnMut(DiscoveryRecord) + Send + 'static,
{
    let listener = BeaconListener::bind(config)?;
    Ok(tokio::spawn(listener.run(on_found)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_beacon_example() {
        let info = parse_beacon(b"AMXB<-Device-Model=AVR-X2400H><-Config-URL=http://x>").unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info["Device-Model"], "AVR-X2400H");
        assert_eq!(info["Config-URL"], "http://x");
    }

    #[test]
    fn test_parse_beacon_real_frame() {
        let frame = b"AMXB<-SDKClass=Receiver><-Make=DENON><-Model=AVR-X2400H>\
                      <-Revision=1.0.0><-Config-Name=Denon AVR><-Config-URL=http://192.168.1.50>\r";
        let info = parse_beacon(frame).unwrap();
        assert_eq!(info["Make"], "DENON");
        assert_eq!(info["Config-Name"], "Denon AVR");
        assert_eq!(info["Config-URL"], "http://192.168.1.50");
        assert_eq!(info.len(), 6);
    }

    #[test]
    fn test_parse_beacon_without_magic() {
        assert!(parse_beacon(b"M-SEARCH * HTTP/1.1\r\n").is_none());
        assert!(parse_beacon(b"amxb<-Model=AVR>").is_none());
        assert!(parse_beacon(b"XAMXB<-Model=AVR>").is_none());
    }

    #[test]
    fn test_parse_beacon_short_datagram() {
        assert!(parse_beacon(b"").is_none());
        assert!(parse_beacon(b"AMX").is_none());
    }

    #[test]
    fn test_parse_beacon_magic_only() {
        let info = parse_beacon(b"AMXB").unwrap();
        assert!(info.is_empty());
    }

    #[test]
    fn test_parse_beacon_skips_malformed_tags() {
        let info = parse_beacon(b"AMXB<-=x><-Model=><-Make=DENON>").unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info["Make"], "DENON");
    }

    #[test]
    fn test_parse_beacon_later_duplicate_wins() {
        let info = parse_beacon(b"AMXB<-Model=A><-Model=B>").unwrap();
        assert_eq!(info["Model"], "B");
    }

    #[test]
    fn test_default_config() {
        let config = BeaconConfig::default();
        assert_eq!(config.group, BEACON_GROUP);
        assert_eq!(config.port, 9131);
        assert_eq!(config.join_retry_interval, Duration::from_secs(5));
    }

    proptest! {
        #[test]
        fn prop_tags_round_trip(
            fields in proptest::collection::btree_map("[A-Za-z][A-Za-z0-9-]{0,12}", "[A-Za-z0-9:/. -]{1,20}", 0..6)
        ) {
            let mut frame = String::from("AMXB");
            for (key, value) in &fields {
                frame.push_str(&format!("<-{}={}>", key, value));
            }
            let parsed = parse_beacon(frame.as_bytes()).unwrap();
            prop_assert_eq!(parsed, fields);
        }

        #[test]
        fn prop_frames_without_magic_are_ignored(body in "[^A].{0,40}") {
            prop_assert!(parse_beacon(body.as_bytes()).is_none());
        }
    }
}
