//! Error taxonomy shared by every transport family.
//!
//! Transports never decide on their own whether a failure is fatal to a
//! connection: they ask [`TransportError::closes_channel`]. The classification is:
//!
//! - protocol errors close the channel when their `close_channel` flag is set,
//! - inbound message size errors always close the channel (the peer's byte
//!   stream can no longer be framed), outbound ones never do,
//! - communication errors always close the channel,
//! - serialization errors close the channel only when the codec reports that
//!   its internal state was mutated before it failed.
//!
//! Application failures raised by a dispatcher are not transport errors; they
//! travel as [`anyhow::Error`] and are turned into failure responses.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::node::Node;

/// Which side of the connection a size check was applied to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Failure reported by a [`MessageCodec`](crate::codec::MessageCodec).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SerializationError {
    /// Human readable reason.
    pub message: String,
    /// The codec mutated shared state (e.g. a type registry) before failing,
    /// so the connection that observed it can no longer be trusted.
    pub corrupted_state: bool,
}

impl SerializationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            corrupted_state: false,
        }
    }

    pub fn corrupting(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            corrupted_state: true,
        }
    }
}

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed frame or handshake.
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        close_channel: bool,
    },

    /// A message does not fit into the binding's `max-msg-size`.
    #[error(
        "{direction} message of {size} bytes exceeds max-msg-size {max} (request id {request_id:?})"
    )]
    MessageSize {
        direction: Direction,
        size: usize,
        max: usize,
        request_id: Option<u64>,
    },

    /// Socket level failure.
    #[error("communication failure with {node}: {source}")]
    Communication {
        node: String,
        #[source]
        source: io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("binding '{0}' is not started")]
    NotStarted(String),

    #[error("binding '{binding}' does not create {requested} transports")]
    WrongFamily {
        binding: String,
        requested: &'static str,
    },

    #[error("no in-process server registered for {0}")]
    NoServer(Node),

    #[error("transport to {0} is closed")]
    Closed(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// A protocol error that always tears the connection down.
    pub fn protocol(message: impl Into<String>) -> Self {
        TransportError::Protocol {
            message: message.into(),
            close_channel: true,
        }
    }

    pub fn communication(node: impl fmt::Display, source: io::Error) -> Self {
        TransportError::Communication {
            node: node.to_string(),
            source,
        }
    }

    /// Returns true when the connection that produced this error must be closed.
    pub fn closes_channel(&self) -> bool {
        match self {
            TransportError::Protocol { close_channel, .. } => *close_channel,
            TransportError::MessageSize { direction, .. } => *direction == Direction::Inbound,
            TransportError::Communication { .. } => true,
            TransportError::Serialization(e) => e.corrupted_state,
            TransportError::Closed(_) => true,
            TransportError::NotStarted(_)
            | TransportError::WrongFamily { .. }
            | TransportError::NoServer(_)
            | TransportError::Config(_) => false,
        }
    }

    /// Socket send/receive timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Communication { source, .. } => {
                matches!(source.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }

    pub fn is_communication(&self) -> bool {
        matches!(self, TransportError::Communication { .. } | TransportError::Closed(_))
    }
}

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;
