//! UDP datagram channel.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::RawChannel;

/// A connected UDP socket as a [`RawChannel`].
///
/// The socket is connected to a single remote peer; datagrams from other
/// sources are filtered out by the OS.
#[derive(Debug)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
}

impl UdpChannel {
    /// Bind to `local` and connect to `remote`.
    pub async fn connect(local: SocketAddr, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Wrap an already-connected UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl RawChannel for UdpChannel {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_pair_roundtrip() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a_sock = UdpSocket::bind(any).await.unwrap();
        let b_sock = UdpSocket::bind(any).await.unwrap();
        let a_addr = a_sock.local_addr().unwrap();
        let b_addr = b_sock.local_addr().unwrap();
        a_sock.connect(b_addr).await.unwrap();
        b_sock.connect(a_addr).await.unwrap();

        let a = UdpChannel::from_socket(a_sock);
        let b = UdpChannel::from_socket(b_sock);

        a.send(b"over the wire").await.unwrap();

        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"over the wire");
    }

    #[tokio::test]
    async fn connect_binds_ephemeral_port() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let peer = UdpSocket::bind(any).await.unwrap();
        let ch = UdpChannel::connect(any, peer.local_addr().unwrap())
            .await
            .unwrap();
        assert_ne!(ch.local_addr().unwrap().port(), 0);
    }
}
