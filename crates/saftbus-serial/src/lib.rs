//! Wire value model and binary serializer for saftbus.
//!
//! Two encodings share one byte layout:
//! - statically typed fields ([`Encode`]/[`Decode`] on Rust types) carry no tag,
//!   the reader must request exactly the types the writer used, in order;
//! - [`Value`] is self-describing and writes a one-byte tag before its body.
//!
//! Scalars are fixed-width little-endian. Strings, byte sequences and
//! containers carry a `u32` length prefix, so a buffer boundary always lines
//! up with a value boundary.

pub mod args;
pub mod codec;
pub mod error;
pub mod signature;
pub mod value;

pub use args::ArgReader;
pub use codec::{Decode, Deserializer, Encode, Serializer};
pub use error::{Result, SerialError};
pub use signature::Signature;
pub use value::{FromValue, IntoValue, Value};
