pub mod address;
pub mod interfaces;
pub mod port;

use std::net::SocketAddr;
use anyhow::{Context, Result};
use shared::protocol::OPCUA_DEFAULT_PORT;

pub use address::AddressRange;
pub use interfaces::{InterfaceSource, NetInterface, SystemInterfaces};
pub use port::PortRange;

/// Range text that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range list is empty")]
    Empty,
    #[error("invalid address range '{0}'")]
    InvalidAddress(String),
    #[error("invalid port range '{0}'")]
    InvalidPort(String),
    #[error("range '{0}' mixes IPv4 and IPv6")]
    MixedFamilies(String),
    #[error("range '{0}' ends before it starts")]
    Reversed(String),
}

/// Split a discovery URL such as `opc.tcp://plc-7:4840/UA/Server` into host
/// and port. The port defaults to 4840.
pub fn split_discovery_url(url: &str) -> Option<(String, u16)> {
    let rest = url.trim().split_once("://").map(|(_, r)| r).unwrap_or(url.trim());
    let authority = rest.split('/').next()?;
    let authority = authority.rsplit_once('@').map(|(_, a)| a).unwrap_or(authority);

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => OPCUA_DEFAULT_PORT,
            None => return None,
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, OPCUA_DEFAULT_PORT),
        }
    };

    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Resolve a discovery URL to the socket addresses it points at
pub async fn resolve_discovery_url(url: &str) -> Result<Vec<SocketAddr>> {
    let (host, port) = split_discovery_url(url)
        .with_context(|| format!("Malformed discovery url: {}", url))?;

    let addresses = tokio::net::lookup_host((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to resolve host {}", host))?
        .collect();

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_discovery_url() {
        assert_eq!(
            split_discovery_url("opc.tcp://plc-7:48010/UA/Server"),
            Some(("plc-7".to_string(), 48010))
        );
        assert_eq!(
            split_discovery_url("opc.tcp://10.0.0.7"),
            Some(("10.0.0.7".to_string(), 4840))
        );
        assert_eq!(
            split_discovery_url("opc.tcp://[fd00::7]:4841/"),
            Some(("fd00::7".to_string(), 4841))
        );
        assert_eq!(split_discovery_url("opc.tcp://plc-7:notaport"), None);
        assert_eq!(split_discovery_url("opc.tcp:///path"), None);
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addresses = resolve_discovery_url("opc.tcp://127.0.0.1:4840").await.unwrap();
        assert_eq!(addresses, vec!["127.0.0.1:4840".parse::<SocketAddr>().unwrap()]);
    }
}
