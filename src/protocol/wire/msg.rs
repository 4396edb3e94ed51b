//! Size-prefixed messages held in pooled chunks.

use std::io::Read;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::{Deserialize, Serialize, WireFrame, FRAME_FIXED_SIZE};
use crate::codec::MessageCodec;
use crate::error::{Direction, SerializationError, TransportError};
use crate::pool::MemChunk;

/// Length of the `totalSize` prefix.
pub const SIZE_PREFIX_LEN: usize = 4;

/// `[int32 totalSize][WireFrame][payload]` stored in a [`MemChunk`].
///
/// A message borrows its chunk for the duration of one send or receive; the
/// frame and payload slices handed out by [`decode`](WireMsg::decode) must not
/// outlive that call because the chunk goes back to the pool afterwards.
#[derive(Debug)]
pub struct WireMsg {
    chunk: MemChunk,
}

impl WireMsg {
    pub fn new(mut chunk: MemChunk) -> Self {
        chunk.clear();
        Self { chunk }
    }

    /// Frames `frame` followed by whatever `write_payload` appends.
    ///
    /// The whole message is built in memory before anything touches a socket,
    /// so an oversized message fails here with nothing transmitted. On error the
    /// chunk is left empty.
    pub fn encode<F>(
        &mut self,
        frame: &WireFrame,
        max_msg_size: usize,
        write_payload: F,
    ) -> Result<usize, TransportError>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), SerializationError>,
    {
        let buf = self.chunk.buffer_mut();
        buf.clear();
        buf.extend_from_slice(&[0_u8; SIZE_PREFIX_LEN]);

        let result = frame
            .serialize(buf)
            .map_err(|e| TransportError::Protocol {
                message: format!("unable to encode frame: {e}"),
                close_channel: false,
            })
            .and_then(|_| write_payload(buf).map_err(TransportError::from));
        if let Err(e) = result {
            buf.clear();
            return Err(e);
        }

        let total = buf.len();
        if total > max_msg_size {
            buf.clear();
            return Err(TransportError::MessageSize {
                direction: Direction::Outbound,
                size: total,
                max: max_msg_size,
                request_id: Some(frame.request_id),
            });
        }
        buf[..SIZE_PREFIX_LEN].copy_from_slice(&(total as i32).to_be_bytes());
        trace!("Encoded message length:{}, request:{}", total, frame.request_id);
        Ok(total)
    }

    /// [`encode`](Self::encode) with the payload serialized by `codec`.
    pub fn encode_payload(
        &mut self,
        frame: &WireFrame,
        codec: &dyn MessageCodec,
        payload: &[u8],
        max_msg_size: usize,
    ) -> Result<usize, TransportError> {
        self.encode(frame, max_msg_size, |dest| codec.serialize(payload, dest))
    }

    /// Encoded bytes, prefix included.
    pub fn as_bytes(&self) -> &[u8] {
        self.chunk.as_slice()
    }

    pub fn total_size(&self) -> usize {
        self.chunk.len()
    }

    /// Splits a received message into its frame and the serialized payload.
    pub fn decode(&self) -> Result<(WireFrame, &[u8]), TransportError> {
        let bytes = self.chunk.as_slice();
        if bytes.len() < SIZE_PREFIX_LEN + FRAME_FIXED_SIZE {
            return Err(TransportError::protocol(format!(
                "message of {} bytes is too short",
                bytes.len()
            )));
        }
        let mut rest = &bytes[SIZE_PREFIX_LEN..];
        let frame = WireFrame::deserialize(&mut rest)?;
        Ok((frame, rest))
    }

    /// Reads one whole message from a blocking stream.
    pub fn read_from<R: Read>(
        &mut self,
        src: &mut R,
        max_msg_size: usize,
        peer: &str,
    ) -> Result<usize, TransportError> {
        let mut prefix = [0_u8; SIZE_PREFIX_LEN];
        src.read_exact(&mut prefix)
            .map_err(|e| TransportError::communication(peer, e))?;
        let total = check_declared_size(i32::from_be_bytes(prefix), max_msg_size)?;

        let buf = self.chunk.buffer_mut();
        buf.clear();
        buf.extend_from_slice(&prefix);
        buf.resize(total, 0);
        src.read_exact(&mut buf[SIZE_PREFIX_LEN..])
            .map_err(|e| TransportError::communication(peer, e))?;
        trace!("Read message length:{} from {}", total, peer);
        Ok(total)
    }

    /// Reads one whole message from an async stream.
    pub async fn read_from_async<R: AsyncRead + Unpin>(
        &mut self,
        src: &mut R,
        max_msg_size: usize,
        peer: &str,
    ) -> Result<usize, TransportError> {
        let mut prefix = [0_u8; SIZE_PREFIX_LEN];
        src.read_exact(&mut prefix)
            .await
            .map_err(|e| TransportError::communication(peer, e))?;
        let total = check_declared_size(i32::from_be_bytes(prefix), max_msg_size)?;

        let buf = self.chunk.buffer_mut();
        buf.clear();
        buf.extend_from_slice(&prefix);
        buf.resize(total, 0);
        src.read_exact(&mut buf[SIZE_PREFIX_LEN..])
            .await
            .map_err(|e| TransportError::communication(peer, e))?;
        trace!("Read message length:{} from {}", total, peer);
        Ok(total)
    }

    pub fn into_chunk(self) -> MemChunk {
        self.chunk
    }
}

/// Validates a `totalSize` prefix before any buffer is sized from it.
fn check_declared_size(declared: i32, max_msg_size: usize) -> Result<usize, TransportError> {
    if declared < (SIZE_PREFIX_LEN + FRAME_FIXED_SIZE) as i32 {
        return Err(TransportError::protocol(format!(
            "declared message size {declared} is too small"
        )));
    }
    let total = declared as usize;
    if total > max_msg_size {
        return Err(TransportError::MessageSize {
            direction: Direction::Inbound,
            size: total,
            max: max_msg_size,
            request_id: None,
        });
    }
    Ok(total)
}
