//! Typed, length-prefixed message framing for saftbus sockets.
//!
//! Every message on a saftbus connection is framed with:
//! - A 4-byte little-endian message type
//! - A 4-byte little-endian payload length
//!
//! Readers consume exactly one frame per call and never buffer ahead, so a
//! socket that polls readable always has the next frame header waiting and
//! descriptors passed alongside a frame are available right after it is read.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_header, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use message::MessageType;
pub use reader::FrameReader;
pub use writer::FrameWriter;
