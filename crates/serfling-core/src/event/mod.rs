//! Serf event model and wire decoding.
//!
//! The event handler helper forwards each Serf event as one frame of
//! NUL-terminated `NAME=VALUE` environment lines, a bare NUL, then the
//! event's stdin body. This module turns those frames into [`Event`] values.

mod decoder;
mod tags;
mod types;

pub use decoder::{FRAME_SEPARATOR, decode, encode_frame};
pub use tags::parse_tags;
pub use types::*;
