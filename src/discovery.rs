use anyhow::{Context, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::domain::DeviceDescriptor;
use crate::hardware::gateway::GET_DEVICE;
use crate::transport::frame::{self, Reply};
use crate::transport::link::MAX_DATAGRAM;

/// One-shot broadcast discovery of devices on the local segment.
pub struct Discovery {
    target: SocketAddr,
    listen: Duration,
}

impl Discovery {
    pub fn broadcast(port: u16, listen: Duration) -> Self {
        Self {
            target: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            listen,
        }
    }

    /// Probe a single address instead of broadcasting.
    pub fn unicast(target: SocketAddr, listen: Duration) -> Self {
        Self { target, listen }
    }

    /// Send one `Marstek.GetDevice` probe and collect answers until the listen window closes.
    pub async fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("Failed to bind discovery socket")?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast")?;

        let probe = json!({ "id": 0, "method": GET_DEVICE, "params": { "ble_mac": "0" } });
        let datagram = serde_json::to_vec(&probe).context("Failed to encode probe")?;
        socket
            .send_to(&datagram, self.target)
            .await
            .with_context(|| format!("Failed to send discovery probe to {}", self.target))?;
        info!(probe_addr = %self.target, listen_ms = self.listen.as_millis() as u64, "discovery probe sent");

        let deadline = Instant::now() + self.listen;
        let mut found: BTreeMap<String, DeviceDescriptor> = BTreeMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(error = %e, "discovery receive failed");
                    break;
                }
                Ok(Ok(received)) => received,
            };
            match parse_reply(&buf[..n], from) {
                Some(desc) => {
                    debug!(%from, ble_mac = %desc.ble_mac, "device answered discovery");
                    found.entry(desc.ble_mac.to_ascii_lowercase()).or_insert(desc);
                }
                None => debug!(%from, "ignoring unrelated datagram"),
            }
        }

        info!(devices = found.len(), "discovery finished");
        Ok(found.into_values().collect())
    }
}

/// Decode a discovery answer. Missing `ip` is filled from the sender address.
pub fn parse_reply(datagram: &[u8], from: SocketAddr) -> Option<DeviceDescriptor> {
    let Reply::Result { result, .. } = frame::decode(datagram).ok()? else {
        return None;
    };
    let mut desc: DeviceDescriptor = serde_json::from_value(result).ok()?;
    if desc.ip.is_empty() {
        desc.ip = from.ip().to_string();
    }
    Some(desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from() -> SocketAddr {
        "192.168.1.77:30000".parse().unwrap()
    }

    #[test]
    fn parses_device_answer_and_fills_ip() {
        let reply = br#"{"id":0,"src":"VenusE-1","result":{"device":"VenusE","ver":111,"ble_mac":"009b08a5aa39","wifi_mac":"7483c2315cf8"}}"#;
        let desc = parse_reply(reply, from()).unwrap();
        assert_eq!(desc.device, "VenusE");
        assert_eq!(desc.ble_mac, "009b08a5aa39");
        assert_eq!(desc.ip, "192.168.1.77");
    }

    #[test]
    fn ignores_errors_and_noise() {
        assert!(parse_reply(br#"{"id":0,"error":{"code":-1,"message":"x"}}"#, from()).is_none());
        assert!(parse_reply(b"hello", from()).is_none());
        assert!(parse_reply(br#"{"id":0,"result":{"mode":"Auto"}}"#, from()).is_none());
    }

    #[tokio::test]
    async fn collects_and_deduplicates_answers() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = device.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, peer) = device.recv_from(&mut buf).await.unwrap();
            let answer = br#"{"id":0,"result":{"device":"VenusE","ble_mac":"AA11","ip":"10.0.0.5"}}"#;
            device.send_to(answer, peer).await.unwrap();
            device.send_to(answer, peer).await.unwrap();
        });

        let found = Discovery::unicast(addr, Duration::from_millis(300))
            .discover()
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ip, "10.0.0.5");
    }
}
