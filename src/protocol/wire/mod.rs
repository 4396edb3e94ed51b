//! Binary envelope of the glue wire protocol.
//!
//! Every message on a socket is laid out as
//!
//! ```text
//! [int32 totalSize][WireFrame][serialized payload]
//! ```
//!
//! `totalSize` counts the whole message, the 4 prefix bytes included, so a
//! reader can frame variable-length messages off a byte stream before handing
//! the remainder to the frame and payload decoders. Multi-byte integers are
//! big-endian throughout.
//!
//! Multiplexed connections additionally open with a [`ClientSite`] handshake
//! identifying the originating process.

use std::io::{Read, Write};

use byteorder::BigEndian;

mod client_site;
mod frame;
mod msg;

pub use client_site::{ClientSite, CLIENT_SITE_MAGIC, MAX_HOST_NAME_BYTES};
pub use frame::{
    FrameType, WireFrame, FRAME_FIXED_SIZE, FRAME_MAGIC, FRAME_VERSION, MAX_HEADERS_LENGTH,
};
pub use msg::{WireMsg, SIZE_PREFIX_LEN};

use crate::error::TransportError;

/// The wire is big endian.
pub type WireEndian = BigEndian;

pub trait Serialize {
    /// Serializes the implementing type to the provided writer.
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

pub trait Deserialize: Sized {
    /// Decodes a value, validating every invariant of its layout.
    ///
    /// Malformed input is reported as a protocol error flagged to close the channel.
    fn deserialize<R: Read>(src: &mut R) -> Result<Self, TransportError>;
}

/// Maps a short read while decoding a fixed layout to a protocol error.
pub(crate) fn truncated(what: &str, e: std::io::Error) -> TransportError {
    TransportError::protocol(format!("truncated {what}: {e}"))
}

pub(crate) fn invalid_data(m: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m)
}
