//! High-level connection handle.
//!
//! [`Link`] wires a [`Controller`] to a [`Transport`] over any
//! [`RawChannel`] and exposes the frame-level API the application sees:
//! connect or accept, send, receive, close.

use std::sync::Arc;

use tokio::sync::watch;

use crate::channel::RawChannel;
use crate::core::{Frame, LinkError};

use super::controller::{Controller, LinkConfig, LinkState, LinkStats};
use super::transport::Transport;

/// One end of a reliable segmented link.
///
/// # Example
///
/// ```no_run
/// use seglink::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> Result<(), LinkError> {
///     let (a, b) = seglink::channel::sim::channel_pair(16);
///     let cfg = LinkConfig::default();
///     let (server, client) = tokio::join!(
///         Link::accept(a, cfg.clone()),
///         Link::connect(b, cfg),
///     );
///     let (server, client) = (server?, client?);
///
///     client.send(b"register readout".to_vec()).await?;
///     let frame = server.recv().await?;
///     assert_eq!(frame.payload(), b"register readout");
///
///     client.close().await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Link {
    controller: Arc<Controller>,
    transport: Option<Transport>,
}

impl Link {
    /// Start configuring a link.
    pub fn builder() -> LinkBuilder {
        LinkBuilder::new()
    }

    /// Active open: start the transport over `channel` and run the
    /// handshake as initiator.
    pub async fn connect<C: RawChannel>(channel: C, cfg: LinkConfig) -> Result<Self, LinkError> {
        let link = Self::attach(channel, cfg);
        link.controller.connect().await?;
        Ok(link)
    }

    /// Passive open: start the transport over `channel` and wait for a peer
    /// to initiate the handshake.
    ///
    /// Waits indefinitely; wrap in [`tokio::time::timeout`] to bound it.
    pub async fn accept<C: RawChannel>(channel: C, cfg: LinkConfig) -> Result<Self, LinkError> {
        let link = Self::attach(channel, cfg);
        let mut rx = link.controller.watch_state();
        loop {
            if *rx.borrow_and_update() == LinkState::Established {
                return Ok(link);
            }
            if rx.changed().await.is_err() {
                return Err(LinkError::Closed);
            }
        }
    }

    /// Wire up a controller and transport without touching the connection
    /// state. The handshake runs on first use, or when the peer dials in.
    pub fn attach<C: RawChannel>(channel: C, cfg: LinkConfig) -> Self {
        let controller = Arc::new(Controller::new(cfg));
        let transport = Transport::start(Arc::new(channel), Arc::clone(&controller));
        Self {
            controller,
            transport: Some(transport),
        }
    }

    /// Send one frame; blocks under backpressure.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), LinkError> {
        self.controller.send_frame(Frame::new(payload.into())).await
    }

    /// Send an already-built [`Frame`].
    pub async fn send_frame(&self, frame: Frame) -> Result<(), LinkError> {
        self.controller.send_frame(frame).await
    }

    /// Receive the next frame from the peer.
    pub async fn recv(&self) -> Result<Frame, LinkError> {
        self.controller.recv_frame().await
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.controller.state()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.controller.watch_state()
    }

    /// Snapshot of the connection counters.
    pub async fn stats(&self) -> LinkStats {
        self.controller.stats().await
    }

    /// The underlying controller.
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Graceful teardown of the connection; the transport keeps running and
    /// a fresh handshake may follow.
    pub async fn close(&self) -> Result<(), LinkError> {
        self.controller.close().await
    }

    /// Stop the transport: cancel the loop tasks, wake every blocked
    /// caller, and wait for background work to end.
    pub async fn shutdown(mut self) {
        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
    }
}

/// Builder for a [`Link`]'s configuration.
#[derive(Debug, Clone, Default)]
pub struct LinkBuilder {
    cfg: LinkConfig,
}

impl LinkBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            cfg: LinkConfig::default(),
        }
    }

    /// Advertised maximum segment payload size.
    pub fn mss(mut self, mss: u16) -> Self {
        self.cfg.mss = mss;
        self
    }

    /// Advertised maximum number of outstanding segments.
    pub fn window(mut self, window: u8) -> Self {
        self.cfg.window = window;
        self
    }

    /// Advertised retransmission timeout.
    pub fn rto(mut self, rto: std::time::Duration) -> Self {
        self.cfg.rto = rto;
        self
    }

    /// Advertised keep-alive interval.
    pub fn keepalive(mut self, keepalive: std::time::Duration) -> Self {
        self.cfg.keepalive = keepalive;
        self
    }

    /// Advertised retransmission limit.
    pub fn max_retries(mut self, retries: u8) -> Self {
        self.cfg.max_retries = retries;
        self
    }

    /// Depth of the inbound, outbound, and delivery queues.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.cfg.queue_depth = depth;
        self
    }

    /// Channel read timeout for the receive loop.
    pub fn read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.cfg.read_timeout = timeout;
        self
    }

    /// Overall handshake timeout.
    pub fn handshake_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.cfg.handshake_timeout = timeout;
        self
    }

    /// The finished configuration.
    pub fn build(self) -> LinkConfig {
        self.cfg
    }

    /// Active open with this configuration.
    pub async fn connect<C: RawChannel>(self, channel: C) -> Result<Link, LinkError> {
        Link::connect(channel, self.cfg).await
    }

    /// Passive open with this configuration.
    pub async fn accept<C: RawChannel>(self, channel: C) -> Result<Link, LinkError> {
        Link::accept(channel, self.cfg).await
    }
}
