//! Protocol module holds everything that touches bytes on the wire.
//!
//! - `wire`: size-prefixed messages, the `WireFrame` envelope and the
//!   `ClientSite` handshake of multiplexed connections.

pub mod wire;
