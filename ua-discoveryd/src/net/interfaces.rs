use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use anyhow::{Context, Result};
use if_addrs::IfAddr;
use shared::types::NetworkClass;

/// A unicast address bound to a local network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub address: IpAddr,
    pub netmask: IpAddr,
    pub class: NetworkClass,
}

/// Source of local network interfaces
pub trait InterfaceSource: Send + Sync {
    /// List interfaces whose class matches `class`
    fn list(&self, class: NetworkClass) -> Result<Vec<NetInterface>>;
}

/// Interfaces of the host the daemon runs on
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn list(&self, class: NetworkClass) -> Result<Vec<NetInterface>> {
        let interfaces = if_addrs::get_if_addrs()
            .context("Failed to enumerate network interfaces")?
            .into_iter()
            .map(|iface| {
                let loopback = iface.is_loopback();
                let (address, netmask) = match &iface.addr {
                    IfAddr::V4(v4) => (IpAddr::V4(v4.ip), IpAddr::V4(v4.netmask)),
                    IfAddr::V6(v6) => (IpAddr::V6(v6.ip), IpAddr::V6(v6.netmask)),
                };
                NetInterface {
                    class: classify(&iface.name, loopback),
                    name: iface.name,
                    address,
                    netmask,
                }
            })
            .filter(|iface| matches_class(iface.class, class))
            .collect();

        Ok(interfaces)
    }
}

/// Classify an interface by its kernel name. Wireless adapters follow the
/// `wl*`/`wlan*`/`ath*` naming on Linux; everything else non-loopback is
/// treated as wired.
pub fn classify(name: &str, loopback: bool) -> NetworkClass {
    if loopback {
        NetworkClass::Loopback
    } else if name.starts_with("wl") || name.starts_with("ath") || name.starts_with("wifi") {
        NetworkClass::Wireless
    } else {
        NetworkClass::Wired
    }
}

pub fn matches_class(class: NetworkClass, filter: NetworkClass) -> bool {
    filter == NetworkClass::All || class == filter
}

impl NetInterface {
    /// IPv4 address and mask, if this is an IPv4 binding
    pub fn ipv4(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        match (self.address, self.netmask) {
            (IpAddr::V4(address), IpAddr::V4(netmask)) => Some((address, netmask)),
            _ => None,
        }
    }

    pub fn is_link_local(&self) -> bool {
        match self.address {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(v6) => is_unicast_link_local(&v6),
        }
    }
}

fn is_unicast_link_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_name() {
        assert_eq!(classify("lo", true), NetworkClass::Loopback);
        assert_eq!(classify("wlp3s0", false), NetworkClass::Wireless);
        assert_eq!(classify("wlan0", false), NetworkClass::Wireless);
        assert_eq!(classify("eth0", false), NetworkClass::Wired);
        assert_eq!(classify("enp0s31f6", false), NetworkClass::Wired);
    }

    #[test]
    fn test_all_matches_every_class() {
        assert!(matches_class(NetworkClass::Wireless, NetworkClass::All));
        assert!(matches_class(NetworkClass::Loopback, NetworkClass::All));
        assert!(!matches_class(NetworkClass::Wireless, NetworkClass::Wired));
    }

    #[test]
    fn test_link_local_detection() {
        let iface = NetInterface {
            name: "eth0".to_string(),
            address: "fe80::1".parse().unwrap(),
            netmask: "ffff:ffff:ffff:ffff::".parse().unwrap(),
            class: NetworkClass::Wired,
        };
        assert!(iface.is_link_local());
        assert!(iface.ipv4().is_none());
    }

    #[test]
    fn test_system_interfaces_include_loopback() {
        let interfaces = SystemInterfaces.list(NetworkClass::Loopback).unwrap();
        assert!(interfaces.iter().all(|i| i.class == NetworkClass::Loopback));
    }
}
