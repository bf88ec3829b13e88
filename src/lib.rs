//! # SEGLINK
//!
//! A reliable segmented transport protocol for FPGA-based hardware control
//! links. SEGLINK moves byte-stream frames between control software and
//! remote devices across channels that can drop, reorder, or duplicate
//! datagrams, and decouples the slow physical transport from the
//! application with background loop tasks and bounded queues. It provides:
//!
//! - **Reliability**: ordered, loss-tolerant delivery over an unreliable
//!   datagram channel, restored by sequence numbers, cumulative
//!   acknowledgments, and retransmission timers
//! - **Flow control**: a negotiated sliding window bounds the segments in
//!   flight; a full window suspends the sender instead of dropping data
//! - **Backpressure**: every queue in the stack is bounded, so a slow
//!   consumer throttles its producer rather than buffering unbounded memory
//! - **Liveness**: heartbeat segments detect a silently dead peer
//! - **Clean shutdown**: loop tasks observe a cancellation token at every
//!   suspension point and are joined before `stop` returns
//!
//! ## Modules
//!
//! - [`core`]: constants, error taxonomy, and the application [`Frame`]
//! - [`wire`]: the bit-exact segment codec
//! - [`queue`]: the bounded blocking queue used at every boundary
//! - [`channel`]: the unreliable-channel contract, UDP adapter, and test
//!   channels
//! - [`link`]: the protocol engine: [`Controller`], [`Transport`], and the
//!   high-level [`Link`]
//! - [`bridge`]: the (external) memory-bridge contract and its transaction
//!   lock capability
//!
//! ## Example
//!
//! ```no_run
//! use seglink::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), LinkError> {
//!     let (a, b) = seglink::channel::sim::channel_pair(16);
//!     let cfg = LinkConfig::default();
//!     let (server, client) = tokio::join!(
//!         Link::accept(a, cfg.clone()),
//!         Link::connect(b, cfg),
//!     );
//!     let (server, client) = (server?, client?);
//!
//!     client.send(b"register readout".to_vec()).await?;
//!     let frame = server.recv().await?;
//!     assert_eq!(frame.payload(), b"register readout");
//!
//!     client.shutdown().await;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod channel;
pub mod core;
pub mod link;
pub mod queue;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::{RawChannel, UdpChannel};
    pub use crate::core::{DecodeError, Frame, LinkError, QueueClosed};
    pub use crate::link::{
        Controller, Link, LinkBuilder, LinkConfig, LinkState, LinkStats, SessionParams, Transport,
    };
    pub use crate::queue::BoundedQueue;
    pub use crate::wire::{Segment, SegmentFlags};
}

// Re-export the types most callers touch at the crate root.
pub use crate::core::{DecodeError, Frame, LinkError, QueueClosed};
pub use channel::{RawChannel, UdpChannel};
pub use link::{Controller, Link, LinkConfig, LinkState, LinkStats, SessionParams, Transport};
pub use queue::BoundedQueue;
pub use wire::{Segment, SegmentFlags};
