//! Transport families and the contracts they share.
//!
//! - [`sync`]: blocking sockets, one persistent connection per client
//!   transport and one OS thread per server connection
//! - [`mpx`]: multiplexed tokio sockets, responses routed per client site
//!   through generation retry queues
//! - [`inproc`]: direct calls into a server registered on the same binding,
//!   no sockets and no serialization
//!
//! Every connection of a socket family registers a [`ConnectionHandle`] with
//! its binding. The handle is the single place where the connection state
//! machine lives:
//!
//! ```text
//! Disconnected -> Connecting -> Active -> (Error | Closing) -> Disposed
//! ```
//!
//! Any socket error, or an error whose [`closes_channel`](crate::TransportError::closes_channel)
//! is set, moves the connection to `Closing`. Client transports reconnect
//! lazily on their next send.

use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::binding::Binding;
use crate::error::Result;
use crate::message::{CallOptions, CallSlot, RequestMsg, ResponseMsg};
use crate::node::Node;

pub mod inproc;
pub mod mpx;
pub mod sync;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Error,
    Closing,
    Disposed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    Server,
}

/// Shared view of one open connection, usable from any thread.
pub struct ConnectionHandle {
    id: u64,
    role: ConnectionRole,
    peer: String,
    state: Mutex<ConnectionState>,
    shutdown: watch::Sender<bool>,
    /// Blocking sockets are shut down through a cloned descriptor.
    stream: Mutex<Option<TcpStream>>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, role: ConnectionRole, peer: String) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            role,
            peer,
            state: Mutex::new(ConnectionState::Disconnected),
            shutdown,
            stream: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("unable to lock connection state mutex")
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// True once a close was requested, whatever the current state.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
            || matches!(
                self.state(),
                ConnectionState::Error | ConnectionState::Closing | ConnectionState::Disposed
            )
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("unable to lock connection state mutex");
        if *state == ConnectionState::Disposed || *state == next {
            return;
        }
        debug!(
            "{:?} connection {} with {}: {:?} -> {:?}",
            self.role, self.id, self.peer, *state, next
        );
        *state = next;
    }

    pub(crate) fn attach_stream(&self, stream: TcpStream) {
        *self.stream.lock().expect("unable to lock connection stream mutex") = Some(stream);
    }

    /// Receiver that flips to `true` when the connection is asked to close.
    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Requests the connection to close. Safe to call from any thread, any
    /// number of times.
    pub fn close(&self) {
        self.set_state(ConnectionState::Closing);
        self.shutdown.send_replace(true);
        let stream = self
            .stream
            .lock()
            .expect("unable to lock connection stream mutex")
            .take();
        if let Some(stream) = stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn dispose(&self) {
        self.close();
        self.set_state(ConnectionState::Disposed);
    }
}

/// Client side of a synchronous family: a send returns once the call is
/// dispatched (oneway) or answered (two-way).
///
/// Not safe for concurrent callers; `&mut self` serializes sends per instance.
pub trait ClientTransport: Send {
    fn node(&self) -> &Node;

    fn send_request(&mut self, request: RequestMsg, options: &CallOptions) -> Result<CallSlot>;

    fn close(&mut self);
}

/// Client side of an asynchronous family: a send returns once the request is
/// written; responses come back through
/// [`Dispatcher::deliver_async_response`](crate::Dispatcher::deliver_async_response).
#[async_trait]
pub trait AsyncClientTransport: Send {
    fn node(&self) -> &Node;

    async fn send_request(
        &mut self,
        request: RequestMsg,
        options: &CallOptions,
    ) -> Result<CallSlot>;

    async fn close(&mut self);
}

/// Server side of one accepted connection (or one in-process endpoint).
pub trait ServerTransport: Send + Sync {
    fn binding(&self) -> &Arc<Binding>;

    /// Peer description used in logs and failure contexts.
    fn peer(&self) -> &str;

    /// Queues a response for delivery. Only asynchronous families implement
    /// this; synchronous servers reply inline and refuse.
    fn send_response(&self, response: ResponseMsg) -> bool {
        debug!("{} replies inline, refusing response {}", self.peer(), response.request_id);
        false
    }

    fn close(&self);
}
