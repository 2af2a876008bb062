//! Denon AV receiver discovery library
//!
//! This crate finds the address of a receiver on the local network. Two
//! sources are supported:
//!
//! - The AMX Device Discovery beacon: receivers periodically multicast an
//!   `AMXB<-Key=Value>...` datagram to `239.255.250.250:9131`.
//! - A one-shot DNS lookup of a known hostname (e.g. `denon-avr-x2400h.local`).
//!
//! Both sources report [`DiscoveryRecord`]s through a callback, tagged with
//! their [`DiscoverySource`]. Candidate
//! addresses can be filtered with the [`reachability`] predicate, which only
//! accepts addresses on a directly attached IPv4 subnet.
//!
//! # Quick Start
//!
//! ```no_run
//! use denon_discovery::{spawn_beacon_discovery, BeaconConfig};
//!
//! # async fn run() -> denon_discovery::Result<()> {
//! let handle = spawn_beacon_discovery(BeaconConfig::default(), |record| {
//!     println!("Found {:?} at {}", record.model(), record.address);
//! })?;
//! handle.await.ok();
//! # Ok(())
//! # }
//! ```

mod beacon;
mod error;
mod hostname;
pub mod reachability;

use std::collections::BTreeMap;
use std::net::IpAddr;

pub use beacon::{
    parse_beacon, spawn_beacon_discovery, BeaconConfig, BeaconListener, BEACON_GROUP,
    BEACON_MAGIC, BEACON_PORT,
};
pub use error::{DiscoveryError, Result};
pub use hostname::{resolve_hostname, spawn_hostname_discovery};
pub use reachability::{is_reachable, LocalInterfaces, ReachabilityCheck};

/// Where a [`DiscoveryRecord`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    /// An AMX beacon datagram
    Beacon,
    /// A lookup of a configured hostname
    Hostname,
    /// Supplied directly by the caller
    Manual,
}

/// A device sighting produced by a discovery source.
///
/// Records are transient: a session consumes each one once when deciding
/// whether to adopt the address, and does not retain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    /// Address the device was seen at
    pub address: IpAddr,
    /// Flat key/value attributes from the beacon
    pub info: BTreeMap<String, String>,
    pub source: DiscoverySource,
}

impl DiscoveryRecord {
    /// Create a beacon record from the sender address and its attributes.
    pub fn new(address: IpAddr, info: BTreeMap<String, String>) -> Self {
        Self {
            address,
            info,
            source: DiscoverySource::Beacon,
        }
    }

    /// Create a record for an address that resolved from `hostname`.
    pub fn from_hostname(address: IpAddr, hostname: &str) -> Self {
        let mut info = BTreeMap::new();
        info.insert("Hostname".to_string(), hostname.to_string());
        Self {
            address,
            info,
            source: DiscoverySource::Hostname,
        }
    }

    /// Create a caller-supplied record with no attributes.
    pub fn bare(address: IpAddr) -> Self {
        Self {
            address,
            info: BTreeMap::new(),
            source: DiscoverySource::Manual,
        }
    }

    /// Model name advertised by the device.
    ///
    /// AMX beacons carry `Device-Model`; some firmware uses plain `Model`.
    pub fn model(&self) -> Option<&str> {
        self.info
            .get("Device-Model")
            .or_else(|| self.info.get("Model"))
            .map(String::as_str)
    }

    /// Whether this record may be adopted by a session looking for `wanted`.
    ///
    /// A record advertising a model must advertise exactly `wanted`. Beacons
    /// without a model are rejected; hostname and manual records carry no
    /// model and pass.
    pub fn matches_model(&self, wanted: &str) -> bool {
        match self.model() {
            Some(model) => model == wanted,
            None => self.source != DiscoverySource::Beacon,
        }
    }
}
