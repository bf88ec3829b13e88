//! Core types shared by every layer: protocol constants, error taxonomy,
//! and the application-level [`Frame`].

pub mod constants;
mod error;
mod frame;

pub use error::{DecodeError, LinkError, QueueClosed};
pub use frame::Frame;
