//! Wire format: the segment codec.
//!
//! Pure data transformation, no I/O and no protocol state. The binary layout
//! is a contract with the peer implementation; see [`segment`] for the exact
//! field order and widths.

mod segment;

pub use segment::{Segment, SegmentFlags, flags};
pub(crate) use segment::{seq_dist, seq_le};
