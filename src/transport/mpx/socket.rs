use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use super::site::PendingResponse;
use crate::transport::{ConnectionHandle, ConnectionRole};

/// One accepted socket of a client site, seen from the response path.
///
/// Responses are handed to the socket's writer task through a bounded
/// channel; the socket itself is never written outside that task.
pub struct SiteSocket {
    handle: Arc<ConnectionHandle>,
    outbound: Sender<PendingResponse>,
    last_activity: Mutex<Instant>,
}

impl SiteSocket {
    /// A socket not registered with any binding, fed through `outbound`.
    pub fn new(id: u64, peer: impl Into<String>, outbound: Sender<PendingResponse>) -> Self {
        let handle = Arc::new(ConnectionHandle::new(id, ConnectionRole::Server, peer.into()));
        Self::with_handle(handle, outbound)
    }

    pub(crate) fn with_handle(
        handle: Arc<ConnectionHandle>,
        outbound: Sender<PendingResponse>,
    ) -> Self {
        Self {
            handle,
            outbound,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn peer(&self) -> &str {
        self.handle.peer()
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// False once the writer went away or a close was requested.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed() && !self.handle.is_closed()
    }

    /// Records traffic on the socket.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        *self.last_activity.lock().expect("unable to lock socket activity mutex") = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_activity.lock().expect("unable to lock socket activity mutex");
        now.saturating_duration_since(last)
    }

    /// Queues a framed response without waiting. The response comes back in
    /// the error when the channel is full or closed.
    pub fn try_send(&self, response: PendingResponse) -> Result<(), TrySendError<PendingResponse>> {
        self.outbound.try_send(response)
    }

    pub fn close(&self) {
        self.handle.close();
    }
}
