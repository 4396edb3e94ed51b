//! Raw codec - pass-through for binary payloads.

use super::MessageCodec;
use crate::error::SerializationError;

/// Format id of [`RawCodec`].
pub const RAW_FORMAT: i32 = 0;

/// Codec that copies payload bytes as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    fn format(&self) -> i32 {
        RAW_FORMAT
    }

    fn name(&self) -> &str {
        "raw"
    }

    #[inline]
    fn serialize(&self, payload: &[u8], dest: &mut Vec<u8>) -> Result<(), SerializationError> {
        dest.extend_from_slice(payload);
        Ok(())
    }

    #[inline]
    fn deserialize(&self, src: &[u8]) -> Result<Vec<u8>, SerializationError> {
        Ok(src.to_vec())
    }
}
