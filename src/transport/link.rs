use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Largest datagram we expect from a device.
pub const MAX_DATAGRAM: usize = 4096;

/// Source of datagram channels to devices.
#[async_trait]
pub trait Link: Send + Sync {
    /// Open a fresh channel to `target`. Each call attempt uses its own channel so
    /// late replies to an abandoned attempt cannot leak into the next one.
    async fn open(&self, target: SocketAddr) -> io::Result<Box<dyn Channel>>;
}

/// Connected, unreliable datagram channel.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()>;
    /// Wait for the next datagram. Never resolves if nothing arrives; callers bound it with a timeout.
    async fn recv(&mut self) -> io::Result<Vec<u8>>;
}

/// Plain UDP link.
#[derive(Debug, Clone, Default)]
pub struct UdpLink;

#[async_trait]
impl Link for UdpLink {
    async fn open(&self, target: SocketAddr) -> io::Result<Box<dyn Channel>> {
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        Ok(Box::new(UdpChannel { socket }))
    }
}

struct UdpChannel {
    socket: UdpSocket,
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Socket errors that mean the device cannot be reached at all.
pub fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotConnected
    ) || matches!(err.raw_os_error(), Some(code) if UNREACHABLE_OS_CODES.contains(&code))
}

// ENETUNREACH, EHOSTUNREACH, EHOSTDOWN on Linux
#[cfg(target_os = "linux")]
const UNREACHABLE_OS_CODES: &[i32] = &[101, 113, 112];
#[cfg(not(target_os = "linux"))]
const UNREACHABLE_OS_CODES: &[i32] = &[];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_link_round_trips_over_loopback() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = device.local_addr().unwrap();

        let mut ch = UdpLink.open(addr).await.unwrap();
        ch.send(b"ping").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, peer) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        device.send_to(b"pong", peer).await.unwrap();

        assert_eq!(ch.recv().await.unwrap(), b"pong".to_vec());
    }

    #[test]
    fn refused_is_unreachable_but_timeout_is_not() {
        assert!(is_unreachable(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_unreachable(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_unreachable(&io::Error::from(io::ErrorKind::InvalidData)));
    }
}
