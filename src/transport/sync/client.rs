use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::binding::{Binding, TransportFamily};
use crate::config::socket_timeout;
use crate::error::{Result, TransportError};
use crate::message::{CallOptions, CallSlot, RequestMsg, ResponseMsg};
use crate::node::Node;
use crate::pool::MemChunk;
use crate::protocol::wire::{FrameType, WireFrame, WireMsg};
use crate::transport::{ClientTransport, ConnectionHandle, ConnectionRole, ConnectionState};

/// Socket timeouts as applied to the OS: (write, read).
type AppliedTimeouts = (Option<Duration>, Option<Duration>);

struct Connection {
    stream: TcpStream,
    handle: Arc<ConnectionHandle>,
    timeouts: Option<AppliedTimeouts>,
}

/// Blocking client transport holding one persistent connection to a node.
///
/// The connection is opened on the first call and reopened on the call
/// following any fatal error, so callers never observe a stale socket.
pub struct SyncClientTransport {
    binding: Arc<Binding>,
    node: Node,
    peer: String,
    connection: Option<Connection>,
    send_chunk: Option<MemChunk>,
    recv_chunk: Option<MemChunk>,
    next_echo_id: u64,
}

impl SyncClientTransport {
    pub fn new(binding: Arc<Binding>, node: Node) -> Result<Self> {
        binding.ensure_ready(TransportFamily::Sync)?;
        Ok(Self {
            peer: node.connect_string(),
            binding,
            node,
            connection: None,
            send_chunk: None,
            recv_chunk: None,
            next_echo_id: 1,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.handle.is_active())
    }

    /// Round trip of an `Echo` frame.
    pub fn echo(&mut self, options: &CallOptions) -> Result<Duration> {
        let echo_id = self.next_echo_id;
        self.next_echo_id += 1;
        let frame = WireFrame::new(FrameType::Echo, self.binding.codec().format(), false, echo_id);

        let started = Instant::now();
        self.guarded(|t| t.transmit(&frame, &[], options))?;
        let (reply, _) = self.guarded(|t| t.receive())?;
        if reply.frame_type != FrameType::EchoResponse || reply.request_id != echo_id {
            let e = TransportError::protocol(format!(
                "expected echo response {echo_id}, got {:?} {}",
                reply.frame_type, reply.request_id
            ));
            self.disconnect();
            return Err(e);
        }
        Ok(started.elapsed())
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.as_ref().is_some_and(|c| c.handle.is_closed()) {
            self.disconnect();
        }
        if self.connection.is_none() {
            self.connection = Some(self.open_connection()?);
        }
        Ok(())
    }

    fn open_connection(&self) -> Result<Connection> {
        let handle = self.binding.register_connection(ConnectionRole::Client, self.peer.clone());
        handle.set_state(ConnectionState::Connecting);
        let stream = match self.dial() {
            Ok(stream) => stream,
            Err(e) => {
                handle.set_state(ConnectionState::Error);
                self.binding.deregister_connection(&handle);
                return Err(e);
            }
        };
        let _ = stream.set_nodelay(true);
        if let Ok(clone) = stream.try_clone() {
            handle.attach_stream(clone);
        }
        handle.set_state(ConnectionState::Active);
        info!("Connected to {}", self.peer);
        Ok(Connection {
            stream,
            handle,
            timeouts: None,
        })
    }

    fn dial(&self) -> Result<TcpStream> {
        let addrs = self.node.resolve().map_err(|e| TransportError::communication(&self.peer, e))?;
        let timeout = socket_timeout(self.binding.client_config().snd_timeout);
        let mut last_error = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connecting to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        let e = last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to connect to")
        });
        Err(TransportError::communication(&self.peer, e))
    }

    /// Applies per-call timeouts, skipping the syscalls when nothing changed
    /// since the previous call.
    fn apply_timeouts(&mut self, options: &CallOptions) -> Result<()> {
        let client = self.binding.client_config();
        let write = options
            .dispatch_timeout
            .filter(|d| !d.is_zero())
            .or(socket_timeout(client.snd_timeout));
        let read = options
            .receive_timeout
            .filter(|d| !d.is_zero())
            .or(socket_timeout(client.rcv_timeout));
        let wanted = (write, read);
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.peer.clone()))?;
        if conn.timeouts != Some(wanted) {
            conn.stream
                .set_write_timeout(wanted.0)
                .and_then(|_| conn.stream.set_read_timeout(wanted.1))
                .map_err(|e| TransportError::communication(&self.peer, e))?;
            conn.timeouts = Some(wanted);
        }
        Ok(())
    }

    /// Writes one framed message. Nothing reaches the socket unless the whole
    /// message was built within `max-msg-size`.
    fn transmit(&mut self, frame: &WireFrame, payload: &[u8], options: &CallOptions) -> Result<()> {
        self.ensure_connected()?;
        self.apply_timeouts(options)?;

        let pool = self.binding.chunk_pool()?;
        let chunk = self.send_chunk.take().unwrap_or_else(|| pool.acquire_or_create());
        let mut msg = WireMsg::new(chunk);
        let max = self.binding.max_msg_size();
        let encoded = if frame.is_control() {
            msg.encode(frame, max, |_| Ok(()))
        } else {
            msg.encode_payload(frame, self.binding.codec().as_ref(), payload, max)
        };

        let written = match (encoded, self.connection.as_mut()) {
            (Ok(size), Some(conn)) => conn
                .stream
                .write_all(msg.as_bytes())
                .map(|_| size)
                .map_err(|e| TransportError::communication(&self.peer, e)),
            (Ok(_), None) => Err(TransportError::Closed(self.peer.clone())),
            (Err(e), _) => Err(e),
        };
        self.send_chunk = Some(msg.into_chunk());

        let size = written?;
        trace!(
            "Sent {:?} {} ({} bytes) to {}",
            frame.frame_type,
            frame.request_id,
            size,
            self.peer
        );
        self.binding.stats().record_sent(size);
        Ok(())
    }

    /// Blocks until one whole message is read, then decodes it.
    fn receive(&mut self) -> Result<(WireFrame, Vec<u8>)> {
        let pool = self.binding.chunk_pool()?;
        let chunk = self.recv_chunk.take().unwrap_or_else(|| pool.acquire_or_create());
        let mut msg = WireMsg::new(chunk);
        let max = self.binding.max_msg_size();
        let codec = self.binding.codec().clone();

        let received = match self.connection.as_mut() {
            Some(conn) => msg.read_from(&mut conn.stream, max, &self.peer).and_then(|size| {
                let (frame, body) = msg.decode()?;
                let payload = if frame.is_control() {
                    Vec::new()
                } else {
                    codec.deserialize(body)?
                };
                Ok((frame, payload, size))
            }),
            None => Err(TransportError::Closed(self.peer.clone())),
        };
        self.recv_chunk = Some(msg.into_chunk());

        let (frame, payload, size) = received?;
        self.binding.stats().record_received(size);
        Ok((frame, payload))
    }

    /// Runs `op`, tearing the connection down when its error requires it.
    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if let Err(e) = &result {
            self.binding.stats().record_error();
            if e.closes_channel() {
                warn!("Closing connection to {}: {}", self.peer, e);
                if let Some(conn) = &self.connection {
                    conn.handle.set_state(ConnectionState::Error);
                }
                self.disconnect();
            } else {
                debug!("Call to {} failed, connection kept: {}", self.peer, e);
            }
        }
        result
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.binding.deregister_connection(&conn.handle);
            debug!("Disconnected from {}", self.peer);
        }
    }
}

impl ClientTransport for SyncClientTransport {
    fn node(&self) -> &Node {
        &self.node
    }

    fn send_request(&mut self, request: RequestMsg, options: &CallOptions) -> Result<CallSlot> {
        let request_id = request.request_id;
        let format = self.binding.codec().format();
        let frame = WireFrame::new(FrameType::GlueMsg, format, request.one_way, request_id)
            .with_headers(request.headers.clone());
        self.guarded(|t| t.transmit(&frame, &request.payload, options))?;
        if request.one_way {
            return Ok(CallSlot::dispatched(request_id));
        }

        let (reply, payload) = self.guarded(|t| t.receive())?;
        if reply.frame_type != FrameType::GlueMsg || reply.request_id != request_id {
            let e = TransportError::protocol(format!(
                "expected response to request {request_id}, got {:?} {}",
                reply.frame_type, reply.request_id
            ));
            self.binding.stats().record_error();
            self.disconnect();
            return Err(e);
        }
        let response = ResponseMsg {
            request_id,
            headers: reply.headers,
            payload,
            arrival: None,
        };
        Ok(CallSlot::completed(response.arrived()))
    }

    fn close(&mut self) {
        self.disconnect();
        for chunk in [self.send_chunk.take(), self.recv_chunk.take()].into_iter().flatten() {
            self.binding.release_chunk(chunk);
        }
    }
}

impl Drop for SyncClientTransport {
    fn drop(&mut self) {
        self.close();
    }
}
