//! Glue RPC - message transports for a request/response RPC layer
//!
//! This library moves opaque request and response payloads between processes
//! and hands them to an application supplied dispatcher. It does not know what
//! a payload means; it frames it, sizes it, routes it and reports failures.
//!
//! ## Transport Families
//!
//! - Sync: blocking sockets, one connection per client transport, one OS thread
//!   per server connection, responses written inline
//! - Mpx: multiplexed tokio sockets grouped by client site, responses queued
//!   and delivered to any live socket of the site with generation retry
//! - InProc: direct calls into a server of the same process
//!
//! ## Main Components
//!
//! - `binding`: configuration, codec and chunk pool shared by the transports
//!   of one family, plus the registry of open connections.
//!
//! - `protocol`: the wire format. Every message is `[int32 totalSize][WireFrame][payload]`,
//!   big-endian; multiplexed connections open with a `ClientSite` handshake.
//!
//! - `transport`: the three families behind common client and server contracts.
//!
//! - `dispatch`: the `Dispatcher` trait an application implements to serve
//!   requests and consume asynchronous responses.
//!
//! - `pool`: reusable I/O buffers with a dormant period and idle eviction.
//!
//! ## Usage
//!
//! Create a [`Binding`], start it, open a server (`SyncServer`, `MpxServer` or
//! `InProcServerTransport`) with a dispatcher, and send `RequestMsg`s through
//! the matching client transport.

pub mod binding;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod stats;
pub mod transport;

pub use binding::{Binding, OperationFlow, TransportFamily};
pub use codec::{MessageCodec, RawCodec};
pub use config::{BindingConfig, SideConfig};
pub use dispatch::{handle_request_guarded, Dispatcher};
pub use error::{Direction, Result, SerializationError, TransportError};
pub use message::{CallOptions, CallSlot, CallStatus, RequestMsg, ResponseMsg};
pub use node::Node;
pub use registry::BindingRegistry;
pub use stats::{StatsSnapshot, TransportStats};
pub use transport::{
    AsyncClientTransport, ClientTransport, ConnectionHandle, ConnectionState, ServerTransport,
};
