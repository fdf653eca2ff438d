//! Peer network addresses and their network-group classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::{ServiceFlags, Timestamp};

/// A peer address as gossiped in address announcements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub services: ServiceFlags,
    /// Last time the address was seen alive, as claimed by the announcer.
    pub timestamp: Timestamp,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags, timestamp: Timestamp) -> Self {
        Self {
            ip,
            port,
            services,
            timestamp,
        }
    }

    pub fn from_socket(addr: SocketAddr, services: ServiceFlags, timestamp: Timestamp) -> Self {
        Self::new(addr.ip(), addr.port(), services, timestamp)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Unique `ip:port` key.
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }

    /// Host part only, used for ban bookkeeping.
    pub fn host(&self) -> String {
        self.ip.to_string()
    }

    /// Coarse network segment used to diversify outbound connections.
    ///
    /// IPv4 addresses group by /16, IPv6 by /32. Loopback addresses share the
    /// `local` group and other non-routable addresses share `unroutable`.
    pub fn group_key(&self) -> String {
        group_key(self.ip)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

fn group_key(ip: IpAddr) -> String {
    let ip = match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };
    if ip.is_loopback() {
        return "local".to_string();
    }
    if !is_routable(ip) {
        return "unroutable".to_string();
    }
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.0.0/16", o[0], o[1])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}::/32", s[0], s[1])
        }
    }
}

/// Whether `ip` is publicly routable.
pub fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_routable_v4(v4);
            }
            let first = v6.segments()[0];
            !(v6.is_unspecified()
                || v6.is_loopback()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

fn is_routable_v4(v4: Ipv4Addr) -> bool {
    let o = v4.octets();
    let shared = o[0] == 100 && (o[1] & 0xc0) == 64;
    !(v4.is_unspecified()
        || v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_broadcast()
        || shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn na(s: &str) -> NetAddress {
        NetAddress::from_socket(s.parse().unwrap(), ServiceFlags::NONE, Timestamp::EPOCH)
    }

    #[test]
    fn ipv4_groups_by_slash_16() {
        assert_eq!(na("8.8.4.4:8333").group_key(), "8.8.0.0/16");
        assert_eq!(na("8.8.200.1:18333").group_key(), na("8.8.1.1:8333").group_key());
        assert_ne!(na("8.9.0.1:8333").group_key(), na("8.8.0.1:8333").group_key());
    }

    #[test]
    fn special_ranges() {
        assert_eq!(na("127.0.0.1:8333").group_key(), "local");
        assert_eq!(na("10.1.2.3:8333").group_key(), "unroutable");
        assert_eq!(na("192.168.1.1:8333").group_key(), "unroutable");
        assert_eq!(na("[2001:db8:1::1]:8333").group_key(), "2001:db8::/32");
    }

    #[test]
    fn key_and_host() {
        let a = na("1.2.3.4:8333");
        assert_eq!(a.key(), "1.2.3.4:8333");
        assert_eq!(a.host(), "1.2.3.4");
    }
}
