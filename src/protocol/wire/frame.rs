//! Fixed-layout frame preceding every payload.
//!
//! ```text
//! [uint16 magic=0xABBA][byte version=1][byte type][int32 format]
//! [byte oneWay][uint64 requestId][int32 headersLen][utf8 headers]
//! ```
//!
//! `headersLen` is `-1` when the frame has no headers.

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use super::{invalid_data, truncated, Deserialize, Serialize, WireEndian};
use crate::error::TransportError;

pub const FRAME_MAGIC: u16 = 0xABBA;
pub const FRAME_VERSION: u8 = 1;
/// Frame length without headers.
pub const FRAME_FIXED_SIZE: usize = 2 + 1 + 1 + 4 + 1 + 8 + 4;
/// Upper bound of the UTF-8 header block.
pub const MAX_HEADERS_LENGTH: usize = 4 * 1024 * 1024;

const NO_HEADERS: i32 = -1;

/// Distinguishes RPC payloads from protocol-internal frames.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    /// Ordinary request or response carrying a serialized payload
    #[default]
    GlueMsg = 0,
    Heartbeat = 1,
    /// Liveness check; answered with `EchoResponse`
    Echo = 2,
    EchoResponse = 3,
    Dummy = 4,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireFrame {
    pub frame_type: FrameType,
    /// Codec format id of the payload that follows.
    pub format: i32,
    pub one_way: bool,
    pub request_id: u64,
    pub headers: Option<String>,
}

impl WireFrame {
    pub fn new(frame_type: FrameType, format: i32, one_way: bool, request_id: u64) -> Self {
        Self {
            frame_type,
            format,
            one_way,
            request_id,
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: Option<String>) -> Self {
        self.headers = headers;
        self
    }

    /// Serialized length: the fixed part plus the header bytes.
    pub fn length(&self) -> usize {
        FRAME_FIXED_SIZE + self.headers.as_ref().map_or(0, |h| h.len())
    }

    /// Returns true for frames the transport answers or swallows itself.
    pub fn is_control(&self) -> bool {
        self.frame_type != FrameType::GlueMsg
    }
}

impl Serialize for WireFrame {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        let headers_len = match &self.headers {
            Some(headers) if headers.len() > MAX_HEADERS_LENGTH => {
                return Err(invalid_data("frame headers exceed 4MiB"));
            }
            Some(headers) => headers.len() as i32,
            None => NO_HEADERS,
        };
        let frame_type = self.frame_type.to_u8().ok_or_else(|| invalid_data("Invalid frame type"))?;

        dest.write_u16::<WireEndian>(FRAME_MAGIC)?;
        dest.write_u8(FRAME_VERSION)?;
        dest.write_u8(frame_type)?;
        dest.write_i32::<WireEndian>(self.format)?;
        dest.write_u8(u8::from(self.one_way))?;
        dest.write_u64::<WireEndian>(self.request_id)?;
        dest.write_i32::<WireEndian>(headers_len)?;
        if let Some(headers) = &self.headers {
            dest.write_all(headers.as_bytes())?;
        }
        Ok(())
    }
}

impl Deserialize for WireFrame {
    fn deserialize<R: Read>(src: &mut R) -> Result<Self, TransportError> {
        let magic = src.read_u16::<WireEndian>().map_err(|e| truncated("frame", e))?;
        if magic != FRAME_MAGIC {
            return Err(TransportError::protocol(format!(
                "bad frame magic {magic:#06x}, expected {FRAME_MAGIC:#06x}"
            )));
        }
        let version = src.read_u8().map_err(|e| truncated("frame", e))?;
        if version != FRAME_VERSION {
            return Err(TransportError::protocol(format!(
                "unsupported frame version {version}, expected {FRAME_VERSION}"
            )));
        }
        let raw_type = src.read_u8().map_err(|e| truncated("frame", e))?;
        let frame_type = FrameType::from_u8(raw_type)
            .ok_or_else(|| TransportError::protocol(format!("unknown frame type {raw_type}")))?;
        let format = src.read_i32::<WireEndian>().map_err(|e| truncated("frame", e))?;
        let one_way = match src.read_u8().map_err(|e| truncated("frame", e))? {
            0 => false,
            1 => true,
            other => {
                return Err(TransportError::protocol(format!("invalid oneway flag {other}")));
            }
        };
        let request_id = src.read_u64::<WireEndian>().map_err(|e| truncated("frame", e))?;
        let headers_len = src.read_i32::<WireEndian>().map_err(|e| truncated("frame", e))?;

        let headers = match headers_len {
            NO_HEADERS => None,
            len if len < 0 => {
                return Err(TransportError::protocol(format!("negative headers length {len}")));
            }
            len if len as usize > MAX_HEADERS_LENGTH => {
                return Err(TransportError::protocol(format!(
                    "headers length {len} exceeds max {MAX_HEADERS_LENGTH}"
                )));
            }
            len => {
                let mut raw = vec![0_u8; len as usize];
                src.read_exact(&mut raw).map_err(|e| truncated("frame headers", e))?;
                let headers = String::from_utf8(raw)
                    .map_err(|_| TransportError::protocol("frame headers are not valid UTF-8"))?;
                Some(headers)
            }
        };

        Ok(WireFrame {
            frame_type,
            format,
            one_way,
            request_id,
            headers,
        })
    }
}
