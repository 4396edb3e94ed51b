//! Binding configuration.
//!
//! Every knob has a default, so an empty JSON object is a valid configuration.
//! Keys use kebab-case:
//!
//! ```json
//! {
//!   "max-msg-size": 8388608,
//!   "client": { "rcv-timeout": 10000, "snd-timeout": 10000 },
//!   "server": { "rcv-buf-size": 65536 },
//!   "idle-chunk-life": 120,
//!   "server-transport-idle-timeout": 120000
//! }
//! ```
//!
//! Timeouts are milliseconds, lifetimes suffixed `-life`/`-seconds` are seconds.
//! A timeout of zero disables it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::protocol::wire::{FRAME_FIXED_SIZE, SIZE_PREFIX_LEN};

pub const DEFAULT_MAX_MSG_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_CHUNK_POOL_COUNT: usize = 512;

/// Socket knobs for one side (client or server) of a binding.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SideConfig {
    pub rcv_buf_size: usize,
    pub snd_buf_size: usize,
    #[serde(with = "millis")]
    pub rcv_timeout: Duration,
    #[serde(with = "millis")]
    pub snd_timeout: Duration,
}

impl Default for SideConfig {
    fn default() -> Self {
        Self {
            rcv_buf_size: DEFAULT_BUF_SIZE,
            snd_buf_size: DEFAULT_BUF_SIZE,
            rcv_timeout: Duration::from_secs(10),
            snd_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BindingConfig {
    pub max_msg_size: usize,
    pub client: SideConfig,
    pub server: SideConfig,
    /// Pooled chunks unused for longer than this are evicted by maintenance.
    #[serde(with = "secs")]
    pub idle_chunk_life: Duration,
    pub max_chunk_pool_count: usize,
    /// A released chunk is not handed out again before this period elapses.
    #[serde(with = "millis")]
    pub chunk_dormant_period: Duration,
    #[serde(with = "secs")]
    pub socket_linger_seconds: Duration,
    /// Server connections without traffic for this long are closed.
    #[serde(with = "millis")]
    pub server_transport_idle_timeout: Duration,
    #[serde(with = "millis")]
    pub maintenance_interval: Duration,
    /// Outbound frames buffered per Mpx server socket.
    pub mpx_socket_queue_capacity: usize,
    /// How often a Sync server connection thread wakes up to check idleness.
    #[serde(with = "millis")]
    pub idle_poll_interval: Duration,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            client: SideConfig::default(),
            server: SideConfig::default(),
            idle_chunk_life: Duration::from_secs(120),
            max_chunk_pool_count: DEFAULT_MAX_CHUNK_POOL_COUNT,
            chunk_dormant_period: Duration::from_secs(60),
            socket_linger_seconds: Duration::from_secs(5),
            server_transport_idle_timeout: Duration::from_secs(120),
            maintenance_interval: Duration::from_secs(3),
            mpx_socket_queue_capacity: 1024,
            idle_poll_interval: Duration::from_millis(500),
        }
    }
}

impl BindingConfig {
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        let config: BindingConfig =
            serde_json::from_str(json).map_err(|e| TransportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        let min_msg = SIZE_PREFIX_LEN + FRAME_FIXED_SIZE;
        if self.max_msg_size < min_msg {
            return Err(TransportError::Config(format!(
                "max-msg-size {} is below the minimal framed message of {} bytes",
                self.max_msg_size, min_msg
            )));
        }
        if self.max_msg_size > i32::MAX as usize {
            return Err(TransportError::Config(format!(
                "max-msg-size {} does not fit the 32-bit size prefix",
                self.max_msg_size
            )));
        }
        if self.max_chunk_pool_count == 0 {
            return Err(TransportError::Config("max-chunk-pool-count must be positive".into()));
        }
        if self.mpx_socket_queue_capacity == 0 {
            return Err(TransportError::Config("mpx-socket-queue-capacity must be positive".into()));
        }
        if self.idle_poll_interval.is_zero() {
            return Err(TransportError::Config("idle-poll-interval must be positive".into()));
        }
        Ok(())
    }
}

/// Maps a configured duration to a socket timeout; zero means none.
pub(crate) fn socket_timeout(value: Duration) -> Option<Duration> {
    if value.is_zero() {
        None
    } else {
        Some(value)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
