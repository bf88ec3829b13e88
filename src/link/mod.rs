//! The reliable-delivery engine.
//!
//! This module holds the protocol state machine and its thread/queue
//! boundary:
//!
//! - [`SessionParams`]: the handshake-negotiated session constants
//! - send and receive windows: sliding-window flow control and reassembly
//!   (crate-internal)
//! - [`Controller`]: connection lifecycle, windowing, retransmission,
//!   segmentation and reassembly
//! - [`Transport`]: the boundary adapter running the receive, transmit, and
//!   dispatch loops over a [`RawChannel`](crate::channel::RawChannel)
//! - [`Link`]: the high-level frame-oriented connection handle

mod controller;
mod endpoint;
mod recv_window;
mod send_window;
mod session;
mod transport;

pub use controller::{Controller, LinkConfig, LinkState, LinkStats};
pub use endpoint::{Link, LinkBuilder};
pub use session::SessionParams;
pub use transport::Transport;
