use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::{OPCUA_TCP_SERVICE_TYPE, TXT_PATH};
use crate::discovery::orchestrator::DiscoveryHandle;

/// URLs announced over multicast that have a register request pending or
/// done. A URL is forgotten when its request fails or its announcement goes
/// away, so the next announcement registers it again.
#[derive(Default)]
struct Announcements {
    by_instance: HashMap<String, String>,
    urls: HashSet<String>,
}

impl Announcements {
    /// Record an announcement. True when `url` needs a register request.
    fn announce(&mut self, fullname: &str, url: String) -> bool {
        if let Some(previous) = self.by_instance.insert(fullname.to_string(), url.clone()) {
            if previous != url && !self.announced_elsewhere(&previous) {
                self.urls.remove(&previous);
            }
        }
        self.urls.insert(url)
    }

    fn failed(&mut self, url: &str) {
        self.urls.remove(url);
    }

    fn removed(&mut self, fullname: &str) {
        if let Some(url) = self.by_instance.remove(fullname) {
            if !self.announced_elsewhere(&url) {
                self.urls.remove(&url);
            }
        }
    }

    fn announced_elsewhere(&self, url: &str) -> bool {
        self.by_instance.values().any(|u| u == url)
    }
}

/// Turn OPC UA multicast announcements into register requests. Removals only
/// reset the bookkeeping; the registry leaves them to scans and the retention
/// purge.
pub async fn run_browser(
    daemon: ServiceDaemon,
    discovery: DiscoveryHandle,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting mDNS browser");

    let receiver = daemon
        .browse(OPCUA_TCP_SERVICE_TYPE)
        .with_context(|| format!("Failed to browse {}", OPCUA_TCP_SERVICE_TYPE))?;

    let mut announcements = Announcements::default();
    let mut requests = JoinSet::new();

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let fullname = info.get_fullname();
                        match announced_url(&info) {
                            Some(url) if announcements.announce(fullname, url.clone()) => {
                                tracing::debug!("Server announced at {}", url);
                                let discovery = discovery.clone();
                                requests.spawn(async move {
                                    match discovery.register(url.clone()).await {
                                        Ok(_) => (url, true),
                                        Err(e) => {
                                            tracing::debug!("Announced server {} not registered: {:#}", url, e);
                                            (url, false)
                                        }
                                    }
                                });
                            }
                            Some(_) => {}
                            None => {
                                tracing::debug!("Skipping announcement {} without address", fullname);
                            }
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        tracing::debug!("Server announcement removed: {}", fullname);
                        announcements.removed(&fullname);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Receiver for {} disconnected: {}", OPCUA_TCP_SERVICE_TYPE, e);
                        break;
                    }
                }
            }

            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                match joined {
                    Ok((url, false)) => announcements.failed(&url),
                    Ok((_, true)) => {}
                    Err(e) => tracing::warn!("Register task failed: {}", e),
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    requests.shutdown().await;
    Ok(())
}

fn announced_url(info: &ServiceInfo) -> Option<String> {
    let path = info
        .get_property_val_str(TXT_PATH)
        .unwrap_or_default();
    build_url(info.get_addresses().iter().copied(), info.get_port(), path)
}

/// URL a server announced itself under. IPv4 addresses are preferred since
/// link-local IPv6 needs a scope to be reachable.
fn build_url(
    addresses: impl Iterator<Item = IpAddr>,
    port: u16,
    path: &str,
) -> Option<String> {
    let mut addresses: Vec<IpAddr> = addresses.collect();
    addresses.sort_by_key(|a| (a.is_ipv6(), *a));
    let host = match addresses.first()? {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };

    let path = path.trim_start_matches('/');
    if path.is_empty() {
        Some(format!("opc.tcp://{}:{}", host, port))
    } else {
        Some(format!("opc.tcp://{}:{}/{}", host, port, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "opc.tcp://10.0.0.7:4840";

    fn ips(list: &[&str]) -> impl Iterator<Item = IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_url_prefers_ipv4() {
        let url = build_url(ips(&["fe80::1", "10.0.0.7"]), 4840, "/UA/Server");
        assert_eq!(url.as_deref(), Some("opc.tcp://10.0.0.7:4840/UA/Server"));
    }

    #[test]
    fn test_url_brackets_ipv6() {
        let url = build_url(ips(&["fd00::7"]), 4841, "");
        assert_eq!(url.as_deref(), Some("opc.tcp://[fd00::7]:4841"));
    }

    #[test]
    fn test_no_address_no_url() {
        assert_eq!(build_url(ips(&[]), 4840, ""), None);
    }

    #[test]
    fn test_repeated_announcement_registers_once() {
        let mut announcements = Announcements::default();
        assert!(announcements.announce("plc1._opcua-tcp._tcp.local.", URL.to_string()));
        assert!(!announcements.announce("plc1._opcua-tcp._tcp.local.", URL.to_string()));
    }

    #[test]
    fn test_failed_register_is_retried_on_next_announcement() {
        let mut announcements = Announcements::default();
        assert!(announcements.announce("plc1._opcua-tcp._tcp.local.", URL.to_string()));
        announcements.failed(URL);
        assert!(announcements.announce("plc1._opcua-tcp._tcp.local.", URL.to_string()));
    }

    #[test]
    fn test_removed_announcement_registers_again() {
        let mut announcements = Announcements::default();
        assert!(announcements.announce("plc1._opcua-tcp._tcp.local.", URL.to_string()));
        announcements.removed("plc1._opcua-tcp._tcp.local.");
        assert!(announcements.announce("plc1._opcua-tcp._tcp.local.", URL.to_string()));
    }

    #[test]
    fn test_removal_keeps_url_announced_by_another_instance() {
        let mut announcements = Announcements::default();
        assert!(announcements.announce("a._opcua-tcp._tcp.local.", URL.to_string()));
        assert!(!announcements.announce("b._opcua-tcp._tcp.local.", URL.to_string()));
        announcements.removed("a._opcua-tcp._tcp.local.");
        assert!(!announcements.announce("b._opcua-tcp._tcp.local.", URL.to_string()));
    }

    #[test]
    fn test_moved_instance_forgets_old_url() {
        let mut announcements = Announcements::default();
        let moved = "opc.tcp://10.0.0.8:4840";
        assert!(announcements.announce("plc1._opcua-tcp._tcp.local.", URL.to_string()));
        assert!(announcements.announce("plc1._opcua-tcp._tcp.local.", moved.to_string()));
        announcements.removed("plc1._opcua-tcp._tcp.local.");
        assert!(announcements.announce("plc2._opcua-tcp._tcp.local.", URL.to_string()));
    }
}
