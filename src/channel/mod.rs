//! The unreliable datagram channel boundary.
//!
//! The protocol core never talks to a socket directly; it sees only the
//! [`RawChannel`] contract. The channel may drop, reorder, or duplicate
//! datagrams; the layers above exist precisely to restore reliability on
//! top of it.

use std::io;

use async_trait::async_trait;

pub mod sim;
mod udp;

pub use udp::UdpChannel;

/// An unreliable point-to-point datagram channel.
///
/// Implementations must be safe to share between the receive and transmit
/// loop tasks. A failed `send` or `recv` is an expected, recoverable event:
/// the transport logs it and retries the next I/O.
#[async_trait]
pub trait RawChannel: Send + Sync + 'static {
    /// Send one datagram.
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Receive one datagram into `buf`, returning the number of bytes read.
    ///
    /// May wait indefinitely; the transport applies its own read timeout so
    /// it can service timers even on a silent link.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}
