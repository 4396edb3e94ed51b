//! Multiplexed transport on tokio sockets.
//!
//! A client opens a connection, introduces itself with its [`ClientSite`]
//! handshake and then only writes requests; every response it reads is handed
//! to [`Dispatcher::deliver_async_response`](crate::Dispatcher::deliver_async_response)
//! and matched by request id above this layer.
//!
//! The server groups accepted sockets by client site. Requests go to
//! [`Dispatcher::dispatch_request`](crate::Dispatcher::dispatch_request);
//! responses come back through [`ServerTransport::send_response`] and are
//! routed by [`ClientSiteState`] to any live socket of the site.
//!
//! [`ClientSite`]: crate::protocol::wire::ClientSite
//! [`ServerTransport::send_response`]: crate::ServerTransport::send_response

use tokio::sync::watch;

mod client;
mod server;
mod site;
mod socket;

pub use client::MpxClientTransport;
pub use server::{MaintenanceReport, MpxServer, MpxServerTransport};
pub use site::{ClientSiteState, DrainReport, PendingResponse, SiteRegistry, GENERATIONS};
pub use socket::SiteSocket;

/// Spins a response sender spends on a busy drain token before leaving the
/// queue to the token holder or to maintenance.
const SEND_DRAIN_SPINS: usize = 64;
const MAINTENANCE_DRAIN_SPINS: usize = 10_000;

/// Resolves once the connection behind `shutdown` is asked to close.
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
