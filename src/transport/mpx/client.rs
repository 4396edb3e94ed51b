use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::shutdown_requested;
use crate::binding::{Binding, TransportFamily};
use crate::config::socket_timeout;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TransportError};
use crate::message::{CallOptions, CallSlot, RequestMsg, ResponseMsg};
use crate::node::Node;
use crate::pool::MemChunk;
use crate::protocol::wire::{ClientSite, FrameType, WireFrame, WireMsg};
use crate::transport::{AsyncClientTransport, ConnectionHandle, ConnectionRole, ConnectionState};

struct Connection {
    writer: OwnedWriteHalf,
    handle: Arc<ConnectionHandle>,
}

/// Client side of the multiplexed family.
///
/// Sends return as soon as the request is written. Responses are read by a
/// background task and handed to the sink dispatcher's
/// [`deliver_async_response`](Dispatcher::deliver_async_response).
pub struct MpxClientTransport {
    binding: Arc<Binding>,
    node: Node,
    peer: String,
    site: ClientSite,
    sink: Arc<dyn Dispatcher>,
    connection: Option<Connection>,
    send_chunk: Option<MemChunk>,
}

impl MpxClientTransport {
    /// Connects to `node` and introduces the process as `site`.
    pub async fn connect(
        binding: Arc<Binding>,
        node: Node,
        site: ClientSite,
        sink: Arc<dyn Dispatcher>,
    ) -> Result<MpxClientTransport> {
        binding.ensure_ready(TransportFamily::Mpx)?;
        let mut transport = MpxClientTransport {
            peer: node.connect_string(),
            binding,
            node,
            site,
            sink,
            connection: None,
            send_chunk: None,
        };
        transport.ensure_connected().await?;
        Ok(transport)
    }

    pub fn client_site(&self) -> &ClientSite {
        &self.site
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.handle.is_active())
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.as_ref().is_some_and(|c| c.handle.is_closed()) {
            self.disconnect();
        }
        if self.connection.is_none() {
            self.connection = Some(self.open_connection().await?);
        }
        Ok(())
    }

    async fn open_connection(&self) -> Result<Connection> {
        let handle = self.binding.register_connection(ConnectionRole::Client, self.peer.clone());
        handle.set_state(ConnectionState::Connecting);
        let stream = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                handle.set_state(ConnectionState::Error);
                self.binding.deregister_connection(&handle);
                return Err(e);
            }
        };

        let (reader, writer) = stream.into_split();
        handle.set_state(ConnectionState::Active);
        tokio::spawn(receive_loop(
            self.binding.clone(),
            reader,
            self.sink.clone(),
            handle.clone(),
            self.peer.clone(),
        ));
        info!("Connected to {} as {}", self.peer, self.site);
        Ok(Connection { writer, handle })
    }

    /// Connects and writes the client site handshake.
    async fn dial(&self) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(self.peer.as_str())
            .await
            .map_err(|e| TransportError::communication(&self.peer, e))?
            .collect();
        let client = self.binding.client_config();
        let connect_timeout = socket_timeout(client.snd_timeout);

        let mut last_error = None;
        for addr in addrs {
            match self.dial_addr(addr, connect_timeout).await {
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

    async fn dial_addr(&self, addr: SocketAddr, limit: Option<Duration>) -> io::Result<TcpStream> {
        let client = self.binding.client_config();
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_recv_buffer_size(client.rcv_buf_size as u32)?;
        socket.set_send_buffer_size(client.snd_buf_size as u32)?;
        socket.set_linger(Some(self.binding.config().socket_linger_seconds))?;

        let mut stream = with_timeout(limit, socket.connect(addr)).await?;
        stream.set_nodelay(true)?;
        with_timeout(limit, stream.write_all(&self.site.to_bytes())).await?;
        Ok(stream)
    }

    async fn write_request(
        &mut self,
        frame: &WireFrame,
        payload: &[u8],
        options: &CallOptions,
    ) -> Result<usize> {
        self.ensure_connected().await?;
        let pool = self.binding.chunk_pool()?;
        let chunk = self.send_chunk.take().unwrap_or_else(|| pool.acquire_or_create());
        let mut msg = WireMsg::new(chunk);
        let codec = self.binding.codec().as_ref();
        let encoded = msg.encode_payload(frame, codec, payload, self.binding.max_msg_size());

        let limit = options
            .dispatch_timeout
            .filter(|d| !d.is_zero())
            .or(socket_timeout(self.binding.client_config().snd_timeout));
        let written = match (encoded, self.connection.as_mut()) {
            (Ok(size), Some(conn)) => with_timeout(limit, conn.writer.write_all(msg.as_bytes()))
                .await
                .map(|_| size)
                .map_err(|e| TransportError::communication(&self.peer, e)),
            (Ok(_), None) => Err(TransportError::Closed(self.peer.clone())),
            (Err(e), _) => Err(e),
        };
        self.send_chunk = Some(msg.into_chunk());
        written
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.binding.deregister_connection(&conn.handle);
            debug!("Disconnected from {}", self.peer);
        }
    }

    fn shutdown(&mut self) {
        self.disconnect();
        if let Some(chunk) = self.send_chunk.take() {
            self.binding.release_chunk(chunk);
        }
    }
}

#[async_trait]
impl AsyncClientTransport for MpxClientTransport {
    fn node(&self) -> &Node {
        &self.node
    }

    async fn send_request(
        &mut self,
        request: RequestMsg,
        options: &CallOptions,
    ) -> Result<CallSlot> {
        let request_id = request.request_id;
        let format = self.binding.codec().format();
        let frame = WireFrame::new(FrameType::GlueMsg, format, request.one_way, request_id)
            .with_headers(request.headers.clone());

        match self.write_request(&frame, &request.payload, options).await {
            Ok(size) => {
                trace!("Sent request {} ({} bytes) to {}", request_id, size, self.peer);
                self.binding.stats().record_sent(size);
            }
            Err(e) => {
                self.binding.stats().record_error();
                if e.closes_channel() {
                    warn!("Closing connection to {}: {}", self.peer, e);
                    if let Some(conn) = &self.connection {
                        conn.handle.set_state(ConnectionState::Error);
                    }
                    self.disconnect();
                }
                return Err(e);
            }
        }

        if request.one_way {
            Ok(CallSlot::dispatched(request_id))
        } else {
            Ok(CallSlot::pending(request_id))
        }
    }

    async fn close(&mut self) {
        self.shutdown();
    }
}

impl Drop for MpxClientTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, op: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, op).await.unwrap_or_else(|_| {
            Err(io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))
        }),
        None => op.await,
    }
}

/// Reads responses until the connection closes.
async fn receive_loop(
    binding: Arc<Binding>,
    mut reader: OwnedReadHalf,
    sink: Arc<dyn Dispatcher>,
    handle: Arc<ConnectionHandle>,
    peer: String,
) {
    let pool = match binding.chunk_pool() {
        Ok(pool) => pool,
        Err(e) => {
            warn!("Receive loop for {} not started: {}", peer, e);
            handle.set_state(ConnectionState::Error);
            return;
        }
    };
    let closed = shutdown_requested(handle.subscribe());
    tokio::pin!(closed);

    let mut msg = WireMsg::new(pool.acquire_or_create());
    loop {
        let read = tokio::select! {
            _ = &mut closed => break,
            read = msg.read_from_async(&mut reader, binding.max_msg_size(), &peer) => read,
        };
        match read.and_then(|size| decode_response(&binding, &msg, size)) {
            Ok(Some(response)) => sink.deliver_async_response(response),
            Ok(None) => {}
            Err(e) => {
                binding.stats().record_error();
                if e.closes_channel() {
                    debug!("Receive loop for {} ends: {}", peer, e);
                    handle.set_state(ConnectionState::Error);
                    break;
                }
                warn!("Response from {} failed: {}", peer, e);
            }
        }
    }
    pool.release(msg.into_chunk());
}

fn decode_response(binding: &Binding, msg: &WireMsg, size: usize) -> Result<Option<ResponseMsg>> {
    binding.stats().record_received(size);
    let (frame, body) = msg.decode()?;
    match frame.frame_type {
        FrameType::GlueMsg => {}
        other => {
            trace!("Ignoring {:?} frame {}", other, frame.request_id);
            return Ok(None);
        }
    }

    let codec = binding.codec();
    if frame.format != codec.format() {
        return Err(TransportError::protocol(format!(
            "payload format {} does not match binding format {}",
            frame.format,
            codec.format()
        )));
    }
    let payload = codec.deserialize(body)?;
    let response = ResponseMsg {
        request_id: frame.request_id,
        headers: frame.headers,
        payload,
        arrival: None,
    };
    Ok(Some(response.arrived()))
}
