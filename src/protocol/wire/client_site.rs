//! Identity of the process that opened a multiplexed connection.
//!
//! Sent once, right after connecting:
//!
//! ```text
//! [int16 totalLenExcludingSelf][int32 magic=0x5555AAAA]
//! [int16 hostNameByteLen][utf8 hostName][16-byte GUID]
//! ```

use std::fmt;
use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use super::{invalid_data, truncated, Deserialize, Serialize, WireEndian};
use crate::error::TransportError;

pub const CLIENT_SITE_MAGIC: u32 = 0x5555_AAAA;
pub const MAX_HOST_NAME_BYTES: usize = 1024;

const GUID_LEN: usize = 16;
/// Bytes after the leading length field, excluding the host name.
const FIXED_BODY_LEN: usize = 4 + 2 + GUID_LEN;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientSite {
    host_name: String,
    app_instance: [u8; GUID_LEN],
}

impl ClientSite {
    pub fn new(
        host_name: impl Into<String>,
        app_instance: [u8; GUID_LEN],
    ) -> Result<Self, TransportError> {
        let host_name = host_name.into();
        validate_host_name(&host_name)?;
        Ok(Self {
            host_name,
            app_instance,
        })
    }

    /// Identity of the current process: the `HOSTNAME` environment variable
    /// (or `localhost`) plus a fresh random instance id.
    pub fn local() -> Self {
        let host_name = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty() && h.len() <= MAX_HOST_NAME_BYTES)
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            host_name,
            app_instance: rand::random(),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn app_instance(&self) -> &[u8; GUID_LEN] {
        &self.app_instance
    }

    /// Length of the handshake on the wire, the leading length field included.
    pub fn wire_length(&self) -> usize {
        2 + FIXED_BODY_LEN + self.host_name.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_length());
        // Writing to a Vec cannot fail and the host name length was validated on construction.
        let _ = self.serialize(&mut buf);
        buf
    }
}

fn validate_host_name(host_name: &str) -> Result<(), TransportError> {
    if host_name.is_empty() {
        return Err(TransportError::protocol("client site host name is empty"));
    }
    if host_name.len() > MAX_HOST_NAME_BYTES {
        return Err(TransportError::protocol(format!(
            "client site host name of {} bytes exceeds max {}",
            host_name.len(),
            MAX_HOST_NAME_BYTES
        )));
    }
    Ok(())
}

impl Serialize for ClientSite {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if self.host_name.is_empty() || self.host_name.len() > MAX_HOST_NAME_BYTES {
            return Err(invalid_data("Invalid client site host name length"));
        }
        let host = self.host_name.as_bytes();
        dest.write_i16::<WireEndian>((FIXED_BODY_LEN + host.len()) as i16)?;
        dest.write_u32::<WireEndian>(CLIENT_SITE_MAGIC)?;
        dest.write_i16::<WireEndian>(host.len() as i16)?;
        dest.write_all(host)?;
        dest.write_all(&self.app_instance)
    }
}

impl Deserialize for ClientSite {
    fn deserialize<R: Read>(src: &mut R) -> Result<Self, TransportError> {
        let total = src.read_i16::<WireEndian>().map_err(|e| truncated("client site", e))?;
        let max_total = FIXED_BODY_LEN + MAX_HOST_NAME_BYTES;
        if total < (FIXED_BODY_LEN + 1) as i16 || total as usize > max_total {
            return Err(TransportError::protocol(format!("invalid client site length {total}")));
        }
        let magic = src.read_u32::<WireEndian>().map_err(|e| truncated("client site", e))?;
        if magic != CLIENT_SITE_MAGIC {
            return Err(TransportError::protocol(format!(
                "bad client site magic {magic:#010x}, expected {CLIENT_SITE_MAGIC:#010x}"
            )));
        }
        let host_len = src.read_i16::<WireEndian>().map_err(|e| truncated("client site", e))?;
        if host_len <= 0 || host_len as usize != total as usize - FIXED_BODY_LEN {
            return Err(TransportError::protocol(format!(
                "client site host name length {host_len} does not match total length {total}"
            )));
        }
        let mut host = vec![0_u8; host_len as usize];
        src.read_exact(&mut host).map_err(|e| truncated("client site", e))?;
        let host_name = String::from_utf8(host)
            .map_err(|_| TransportError::protocol("client site host name is not valid UTF-8"))?;
        let mut app_instance = [0_u8; GUID_LEN];
        src.read_exact(&mut app_instance).map_err(|e| truncated("client site", e))?;

        ClientSite::new(host_name, app_instance)
    }
}

impl fmt::Debug for ClientSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSite({}, ", self.host_name)?;
        for b in &self.app_instance {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for ClientSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
