//! Local reachability predicate.
//!
//! An address is reachable when it lies on the same subnet as one of the
//! host's non-loopback IPv4 interfaces, i.e. `(candidate & mask) == (iface & mask)`.
//! Discovery uses this to ignore beacons relayed from networks the receiver's
//! telnet port cannot be reached on.

use std::net::{IpAddr, Ipv4Addr};

/// An IPv4 interface address together with its netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceV4 {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl InterfaceV4 {
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self { address, netmask }
    }

    /// Parse an interface from dotted-quad address and netmask strings.
    pub fn parse(address: &str, netmask: &str) -> Option<Self> {
        Some(Self::new(parse_ipv4(address)?, parse_ipv4(netmask)?))
    }

    /// Whether `candidate` is on this interface's subnet.
    pub fn contains(&self, candidate: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(candidate) & mask == u32::from(self.address) & mask
    }
}

/// Parse a strict dotted-quad IPv4 address.
///
/// Anything other than four in-range decimal octets is rejected.
pub fn parse_ipv4(address: &str) -> Option<Ipv4Addr> {
    address.trim().parse().ok()
}

/// Check `candidate` against an explicit interface list.
///
/// Returns `false` for malformed addresses.
pub fn is_reachable_from(candidate: &str, interfaces: &[InterfaceV4]) -> bool {
    let Some(candidate) = parse_ipv4(candidate) else {
        return false;
    };
    interfaces.iter().any(|iface| iface.contains(candidate))
}

/// Check `candidate` against the host's current interfaces.
pub fn is_reachable(candidate: &str) -> bool {
    is_reachable_from(candidate, &local_interfaces())
}

/// Enumerate the host's non-loopback IPv4 interfaces.
#[cfg(unix)]
pub fn local_interfaces() -> Vec<InterfaceV4> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::debug!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    addrs
        .filter(|ifa| !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
        .filter_map(|ifa| {
            let address = ifa.address.as_ref()?.as_sockaddr_in()?.ip();
            let netmask = ifa.netmask.as_ref()?.as_sockaddr_in()?.ip();
            Some(InterfaceV4::new(
                Ipv4Addr::from(address),
                Ipv4Addr::from(netmask),
            ))
        })
        .collect()
}

#[cfg(not(unix))]
pub fn local_interfaces() -> Vec<InterfaceV4> {
    Vec::new()
}

/// Reachability decision used by a session when adopting addresses.
pub trait ReachabilityCheck: Send + Sync {
    fn is_reachable(&self, address: IpAddr) -> bool;
}

/// Checks candidates against the host's live interface table.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalInterfaces;

impl ReachabilityCheck for LocalInterfaces {
    fn is_reachable(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(v4) => local_interfaces().iter().any(|iface| iface.contains(v4)),
            IpAddr::V6(_) => false,
        }
    }
}

impl<F> ReachabilityCheck for F
where
    F: Fn(IpAddr) -> bool + Send + Sync,
{
    fn is_reachable(&self, address: IpAddr) -> bool {
        self(address)
    }
}
