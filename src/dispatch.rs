//! Dispatcher module defines the interface between the transports and the
//! component that actually serves calls.
//!
//! A transport only moves frames. What a request means, and which response it
//! produces, is decided by a [`Dispatcher`] supplied by the application:
//!
//! - synchronous families (Sync sockets, in-process) call
//!   [`handle_request`](Dispatcher::handle_request) and write the result back
//!   inline,
//! - the multiplexed family calls [`dispatch_request`](Dispatcher::dispatch_request)
//!   from its I/O task and expects the response later through
//!   [`ServerTransport::send_response`],
//! - whenever serving fails, [`handle_request_failure`](Dispatcher::handle_request_failure)
//!   builds the best-effort failure response,
//! - multiplexed clients hand every response they receive to
//!   [`deliver_async_response`](Dispatcher::deliver_async_response).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{error, warn};

use crate::message::{RequestMsg, ResponseMsg};
use crate::transport::ServerTransport;

pub trait Dispatcher: Send + Sync {
    /// Serves a request on the calling thread.
    ///
    /// Oneway requests are handled too; the transport discards the response.
    fn handle_request(&self, request: RequestMsg) -> anyhow::Result<ResponseMsg>;

    /// Starts serving a request without blocking the caller.
    ///
    /// Called on an I/O task, so implementations must return quickly. The
    /// default serves the request inline and replies through `transport`,
    /// which is only suitable for handlers that never block.
    fn dispatch_request(&self, request: RequestMsg, transport: Arc<dyn ServerTransport>) {
        let one_way = request.one_way;
        let response = handle_request_guarded(self, request, transport.peer());
        if !one_way && !transport.send_response(response) {
            warn!("Response could not be queued for {}", transport.peer());
        }
    }

    /// Builds the response sent back when serving `request_id` failed.
    ///
    /// # Arguments
    ///
    /// * `request_id` - id of the failed request
    /// * `one_way` - whether the caller expects a response at all
    /// * `error` - what went wrong
    /// * `context` - where it went wrong, for diagnostics
    fn handle_request_failure(
        &self,
        request_id: u64,
        one_way: bool,
        error: &anyhow::Error,
        context: &str,
    ) -> ResponseMsg;

    /// Receives a response read by an asynchronous client transport.
    ///
    /// Runs on the client's receive task; it must hand the response off
    /// (typically into a channel) and return immediately.
    fn deliver_async_response(&self, response: ResponseMsg) {
        warn!("No async response consumer, dropping response {}", response.request_id);
    }
}

/// Calls [`Dispatcher::handle_request`], turning errors and panics into the
/// dispatcher's failure response.
pub fn handle_request_guarded<D: Dispatcher + ?Sized>(
    dispatcher: &D,
    request: RequestMsg,
    context: &str,
) -> ResponseMsg {
    let request_id = request.request_id;
    let one_way = request.one_way;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.handle_request(request)))
        .unwrap_or_else(|payload| {
            Err(anyhow!("dispatcher panicked: {}", panic_message(payload.as_ref())))
        });

    match outcome {
        Ok(response) => response,
        Err(e) => {
            error!("Request {} from {} failed: {:?}", request_id, context, e);
            dispatcher.handle_request_failure(request_id, one_way, &e, context)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
