//! Payload codecs.
//!
//! A binding owns exactly one [`MessageCodec`]. The codec turns the opaque
//! payload of a [`RequestMsg`](crate::RequestMsg)/[`ResponseMsg`](crate::ResponseMsg)
//! into the bytes that follow the wire frame, and back. Its `format` id is
//! written into every frame so a server can reject peers speaking another
//! encoding.
//!
//! - [`RawCodec`] - pass-through for payloads that are already bytes

mod raw;

pub use raw::RawCodec;

use crate::error::SerializationError;

/// Serializer contract consumed by every transport.
///
/// Implementations must be safe to call repeatedly on a reused destination
/// buffer: `serialize` appends to `dest` and never assumes it starts empty.
pub trait MessageCodec: Send + Sync {
    /// Numeric format id written into `WireFrame::format`.
    fn format(&self) -> i32;

    /// Name reported as the binding's encoding format.
    fn name(&self) -> &str;

    fn serialize(&self, payload: &[u8], dest: &mut Vec<u8>) -> Result<(), SerializationError>;

    fn deserialize(&self, src: &[u8]) -> Result<Vec<u8>, SerializationError>;
}
