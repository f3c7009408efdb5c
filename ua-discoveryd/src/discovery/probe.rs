use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use shared::types::EndpointDescriptor;
use tokio::net::TcpStream;

/// Handshakes get at least this long, even with aggressive port timeouts
const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Ports tried to decide whether a host answers at all
const DEFAULT_REACHABILITY_PORTS: &[u16] = &[4840, 80, 443, 22];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

/// Result of a low level connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Refused,
    Unreachable,
    TimedOut,
}

/// Result of probing one address:port, consumed by the scheduler's
/// accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok(Vec<EndpointDescriptor>),
    Unreachable,
    Refused,
    TimedOut,
    HandshakeFailed(String),
}

impl ProbeOutcome {
    /// The target gave a definite answer within the timeout
    pub fn answered(&self) -> bool {
        !matches!(self, ProbeOutcome::TimedOut)
    }
}

/// Lightweight network level reachability check of a host
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn reach(&self, address: IpAddr, timeout: Duration) -> Reachability;
}

/// Low level connect to a single port
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn connect(&self, target: SocketAddr, timeout: Duration) -> ConnectOutcome;
}

/// OPC UA handshake collaborator. Returns every endpoint the server at
/// `target` exposes, or an error when it does not speak the protocol.
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    async fn find_endpoints(
        &self,
        target: SocketAddr,
        timeout: Duration,
    ) -> anyhow::Result<Vec<EndpointDescriptor>>;
}

/// Plain TCP connect probe
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortProbe;

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn connect(&self, target: SocketAddr, timeout: Duration) -> ConnectOutcome {
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Err(_) => ConnectOutcome::TimedOut,
            Ok(Ok(_stream)) => ConnectOutcome::Connected,
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => ConnectOutcome::Refused,
            Ok(Err(e)) => {
                tracing::trace!("Connect to {} failed: {}", target, e);
                ConnectOutcome::Unreachable
            }
        }
    }
}

/// Reachability through TCP: a host that accepts or actively refuses a
/// connection on any of a few common ports is up. Raw ICMP would need
/// elevated privileges.
#[derive(Debug, Clone)]
pub struct TcpHostProbe {
    ports: Vec<u16>,
}

impl Default for TcpHostProbe {
    fn default() -> Self {
        Self {
            ports: DEFAULT_REACHABILITY_PORTS.to_vec(),
        }
    }
}

#[async_trait]
impl HostProbe for TcpHostProbe {
    async fn reach(&self, address: IpAddr, timeout: Duration) -> Reachability {
        let mut attempts: FuturesUnordered<_> = self
            .ports
            .iter()
            .map(|&port| TcpPortProbe.connect(SocketAddr::new(address, port), timeout))
            .collect();

        while let Some(outcome) = attempts.next().await {
            if matches!(outcome, ConnectOutcome::Connected | ConnectOutcome::Refused) {
                return Reachability::Reachable;
            }
        }
        Reachability::Unreachable
    }
}

/// Connect to `target` and, when something listens, run the handshake.
pub async fn probe_endpoint(
    port_probe: &dyn PortProbe,
    discovery: &dyn EndpointDiscovery,
    target: SocketAddr,
    timeout: Duration,
) -> ProbeOutcome {
    let connected = tokio::time::timeout(timeout, port_probe.connect(target, timeout))
        .await
        .unwrap_or(ConnectOutcome::TimedOut);
    match connected {
        ConnectOutcome::Connected => {}
        ConnectOutcome::Refused => return ProbeOutcome::Refused,
        ConnectOutcome::Unreachable => return ProbeOutcome::Unreachable,
        ConnectOutcome::TimedOut => return ProbeOutcome::TimedOut,
    }
    handshake(discovery, target, timeout).await
}

/// Run only the handshake, for targets known to be listening
pub async fn handshake(
    discovery: &dyn EndpointDiscovery,
    target: SocketAddr,
    timeout: Duration,
) -> ProbeOutcome {
    let timeout = timeout.max(MIN_HANDSHAKE_TIMEOUT);
    match tokio::time::timeout(timeout, discovery.find_endpoints(target, timeout)).await {
        Ok(Ok(endpoints)) if !endpoints.is_empty() => ProbeOutcome::Ok(endpoints),
        Ok(Ok(_)) => ProbeOutcome::HandshakeFailed("no endpoints reported".to_string()),
        Ok(Err(e)) => ProbeOutcome::HandshakeFailed(e.to_string()),
        Err(_) => ProbeOutcome::HandshakeFailed("handshake timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let outcome = TcpPortProbe.connect(target, Duration::from_secs(2)).await;
        assert_eq!(outcome, ConnectOutcome::Connected);
    }

    #[tokio::test]
    async fn test_tcp_probe_reports_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let outcome = TcpPortProbe.connect(target, Duration::from_secs(2)).await;
        assert_eq!(outcome, ConnectOutcome::Refused);
    }

    #[tokio::test]
    async fn test_host_probe_counts_refusal_as_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpHostProbe { ports: vec![port] };
        let reach = probe.reach("127.0.0.1".parse().unwrap(), Duration::from_secs(2)).await;
        assert_eq!(reach, Reachability::Reachable);
    }

    struct Failing;

    #[async_trait]
    impl EndpointDiscovery for Failing {
        async fn find_endpoints(
            &self,
            _target: SocketAddr,
            _timeout: Duration,
        ) -> anyhow::Result<Vec<EndpointDescriptor>> {
            anyhow::bail!("not an OPC UA server")
        }
    }

    #[tokio::test]
    async fn test_handshake_failure_is_an_outcome() {
        let outcome = handshake(&Failing, "127.0.0.1:4840".parse().unwrap(), Duration::from_secs(1)).await;
        assert!(matches!(outcome, ProbeOutcome::HandshakeFailed(reason) if reason.contains("OPC UA")));
    }
}
