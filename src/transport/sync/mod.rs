//! Blocking socket transport.
//!
//! A [`SyncClientTransport`] keeps one persistent TCP connection to its node
//! and carries a single call at a time: it writes the framed request and, for
//! two-way calls, blocks until the whole response is read. A [`SyncServer`]
//! accepts connections on a listener thread and serves each one on a dedicated
//! OS thread until the peer leaves, the connection idles out or a fatal error
//! occurs.

mod client;
mod server;

pub use client::SyncClientTransport;
pub use server::{SyncServer, SyncServerTransport};
