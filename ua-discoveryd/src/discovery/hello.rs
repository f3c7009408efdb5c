use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use shared::types::{ApplicationInfo, ApplicationType, EndpointDescriptor, EndpointInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use super::probe::EndpointDiscovery;

const RECEIVE_BUFFER_SIZE: u32 = 65536;
const SEND_BUFFER_SIZE: u32 = 65536;

/// Handshake collaborator that only performs the OPC UA TCP Hello /
/// Acknowledge exchange. A listener that acknowledges is reported as one
/// endpoint keyed by its discovery URL; security configuration is not
/// negotiated, so mode and policy stay unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct UacpHelloDiscovery;

#[async_trait]
impl EndpointDiscovery for UacpHelloDiscovery {
    async fn find_endpoints(
        &self,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<EndpointDescriptor>> {
        let url = format!("opc.tcp://{}", target);

        tokio::time::timeout(timeout, exchange_hello(target, &url))
            .await
            .context("Hello exchange timed out")??;

        let application = ApplicationInfo {
            application_uri: url.clone(),
            application_type: ApplicationType::Server,
            discovery_urls: BTreeSet::from([url.clone()]),
            ..Default::default()
        };
        let endpoint = EndpointInfo {
            url,
            ..Default::default()
        };

        Ok(vec![EndpointDescriptor {
            application,
            endpoint,
            host_address: Some(target),
        }])
    }
}

async fn exchange_hello(target: SocketAddr, url: &str) -> Result<()> {
    let mut stream = TcpStream::connect(target)
        .await
        .with_context(|| format!("Failed to connect to {}", target))?;

    stream
        .write_all(&hello_message(url))
        .await
        .context("Failed to send hello")?;

    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .context("Failed to read hello response")?;

    match &header[0..3] {
        b"ACK" => Ok(()),
        b"ERR" => bail!("Server at {} rejected hello", target),
        _ => bail!("Response from {} is not OPC UA TCP", target),
    }
}

fn hello_message(url: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(24 + url.len());
    body.extend_from_slice(&0u32.to_le_bytes()); // protocol version
    body.extend_from_slice(&RECEIVE_BUFFER_SIZE.to_le_bytes());
    body.extend_from_slice(&SEND_BUFFER_SIZE.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // max message size, 0 = unlimited
    body.extend_from_slice(&0u32.to_le_bytes()); // max chunk count, 0 = unlimited
    body.extend_from_slice(&(url.len() as i32).to_le_bytes());
    body.extend_from_slice(url.as_bytes());

    let mut message = Vec::with_capacity(8 + body.len());
    message.extend_from_slice(b"HELF");
    message.extend_from_slice(&((8 + body.len()) as u32).to_le_bytes());
    message.extend_from_slice(&body);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve_once(reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 8];
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[0..4], b"HELF");
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let mut body = vec![0u8; size - 8];
            socket.read_exact(&mut body).await.unwrap();
            socket.write_all(reply).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_hello_message_layout() {
        let message = hello_message("opc.tcp://10.0.0.7:4840");
        assert_eq!(&message[0..4], b"HELF");
        let size = u32::from_le_bytes([message[4], message[5], message[6], message[7]]);
        assert_eq!(size as usize, message.len());
        assert!(message.ends_with(b"opc.tcp://10.0.0.7:4840"));
    }

    #[tokio::test]
    async fn test_acknowledged_hello_yields_endpoint() {
        let target = serve_once(b"ACKF\x1c\x00\x00\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00").await;

        let endpoints = UacpHelloDiscovery
            .find_endpoints(target, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].endpoint.url, format!("opc.tcp://{}", target));
        assert_eq!(endpoints[0].host_address, Some(target));
    }

    #[tokio::test]
    async fn test_foreign_protocol_is_rejected() {
        let target = serve_once(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;

        let result = UacpHelloDiscovery
            .find_endpoints(target, Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}
