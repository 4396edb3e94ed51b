use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::binding::{Binding, TransportFamily};
use crate::config::socket_timeout;
use crate::dispatch::{handle_request_guarded, Dispatcher};
use crate::error::{Result, TransportError};
use crate::message::{RequestMsg, ResponseMsg};
use crate::node::Node;
use crate::pool::{ChunkPool, MemChunk};
use crate::protocol::wire::{FrameType, WireFrame, WireMsg};
use crate::transport::{ConnectionHandle, ConnectionRole, ConnectionState, ServerTransport};

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Listener serving each accepted connection on its own thread.
pub struct SyncServer {
    binding: Arc<Binding>,
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<dyn Dispatcher>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SyncServer {
    /// Binds a listener to `addr` ("ip:port"; port 0 picks a free port).
    pub fn bind(
        binding: Arc<Binding>,
        addr: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<SyncServer> {
        binding.ensure_ready(TransportFamily::Sync)?;
        let listener =
            TcpListener::bind(addr).map_err(|e| TransportError::communication(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::communication(addr, e))?;
        info!("Listening on {:?}", local_addr);
        Ok(SyncServer {
            binding,
            listener,
            local_addr,
            dispatcher,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Node clients use to reach this server.
    pub fn node(&self) -> Node {
        Node::from(self.local_addr)
    }

    /// Starts the accept thread. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let listener = self
            .listener
            .try_clone()
            .and_then(|l| l.set_nonblocking(true).map(|_| l))
            .map_err(|e| TransportError::communication(self.local_addr, e))?;
        let binding = self.binding.clone();
        let dispatcher = self.dispatcher.clone();
        let running = self.running.clone();

        let accept_thread = thread::Builder::new()
            .name(format!("glue-sync-accept-{}", self.local_addr.port()))
            .spawn(move || accept_loop(listener, binding, dispatcher, running))
            .map_err(|e| TransportError::communication(self.local_addr, e))?;
        *self
            .accept_thread
            .lock()
            .expect("unable to lock accept thread mutex") = Some(accept_thread);
        Ok(())
    }

    /// Stops accepting. Established connections keep running until they end
    /// or the binding is stopped.
    ///
    /// While the binding is stopped the accept thread keeps running but
    /// refuses every connection, so a restarted binding serves again.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let accept_thread = self
            .accept_thread
            .lock()
            .expect("unable to lock accept thread mutex")
            .take();
        if let Some(accept_thread) = accept_thread {
            let _ = accept_thread.join();
            info!("Stopped listening on {:?}", self.local_addr);
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    binding: Arc<Binding>,
    dispatcher: Arc<dyn Dispatcher>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) if !binding.is_started() => {
                info!(
                    "Refusing connection from {}, binding '{}' is stopped",
                    addr,
                    binding.name()
                );
                drop(stream);
            }
            Ok((stream, addr)) => spawn_connection(&binding, &dispatcher, stream, addr),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL)
            }
            Err(e) => {
                error!("Accept error {:?}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn spawn_connection(
    binding: &Arc<Binding>,
    dispatcher: &Arc<dyn Dispatcher>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let peer = addr.to_string();
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("Dropping connection from {}: {}", peer, e);
        return;
    }
    let _ = stream.set_nodelay(true);
    let handle = binding.register_connection(ConnectionRole::Server, peer.clone());
    let transport = SyncServerTransport {
        binding: binding.clone(),
        dispatcher: dispatcher.clone(),
        handle: handle.clone(),
        peer: peer.clone(),
    };
    let spawned = thread::Builder::new().name(format!("glue-sync-{peer}")).spawn(move || {
        if let Err(e) = transport.serve(stream) {
            debug!("Connection loop broken due to {:?}", e);
        }
    });
    if let Err(e) = spawned {
        error!("Unable to spawn connection thread for {}: {}", peer, e);
        binding.deregister_connection(&handle);
    }
}

/// Buffers one connection thread reads into and writes from.
#[derive(Default)]
struct ConnectionChunks {
    recv: Option<MemChunk>,
    send: Option<MemChunk>,
}

/// Server side of one accepted blocking connection.
pub struct SyncServerTransport {
    binding: Arc<Binding>,
    dispatcher: Arc<dyn Dispatcher>,
    handle: Arc<ConnectionHandle>,
    peer: String,
}

impl SyncServerTransport {
    /// Serves the connection on the current thread until it ends.
    fn serve(self, mut stream: TcpStream) -> anyhow::Result<()> {
        if let Ok(clone) = stream.try_clone() {
            self.handle.attach_stream(clone);
        }
        self.handle.set_state(ConnectionState::Active);
        info!("Accepting connection from {}", self.peer);

        let mut chunks = ConnectionChunks::default();
        let result = self.connection_loop(&mut stream, &mut chunks);

        for chunk in [chunks.recv, chunks.send].into_iter().flatten() {
            self.binding.release_chunk(chunk);
        }
        if result.is_err() {
            self.handle.set_state(ConnectionState::Error);
        }
        self.binding.deregister_connection(&self.handle);
        info!("Connection from {} closed", self.peer);
        result
    }

    fn connection_loop(
        &self,
        stream: &mut TcpStream,
        chunks: &mut ConnectionChunks,
    ) -> anyhow::Result<()> {
        let config = self.binding.config();
        let idle_timeout = socket_timeout(config.server_transport_idle_timeout);
        let rcv_timeout = socket_timeout(config.server.rcv_timeout);
        stream.set_write_timeout(socket_timeout(config.server.snd_timeout))?;
        let pool = self.binding.chunk_pool()?;

        let mut last_activity = Instant::now();
        let mut peeked = [0_u8; 1];
        loop {
            if self.handle.is_closed() {
                return Ok(());
            }

            // Wait for data in short slices so idleness and close requests are noticed.
            stream.set_read_timeout(Some(config.idle_poll_interval))?;
            match stream.peek(&mut peeked) {
                Ok(0) => {
                    debug!("{} closed the connection", self.peer);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    if idle_timeout.is_some_and(|idle| last_activity.elapsed() >= idle) {
                        info!("Closing idle connection from {}", self.peer);
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            stream.set_read_timeout(rcv_timeout)?;
            match self.process_message(stream, &pool, chunks) {
                Ok(()) => last_activity = Instant::now(),
                Err(e) => {
                    self.binding.stats().record_error();
                    if e.closes_channel() {
                        warn!("Closing connection from {}: {}", self.peer, e);
                        return Err(e.into());
                    }
                    warn!("Message from {} failed: {}", self.peer, e);
                }
            }
        }
    }

    /// Reads one message and, for two-way requests, writes the response.
    fn process_message(
        &self,
        stream: &mut TcpStream,
        pool: &ChunkPool,
        chunks: &mut ConnectionChunks,
    ) -> Result<()> {
        let chunk = chunks.recv.take().unwrap_or_else(|| pool.acquire_or_create());
        let mut msg = WireMsg::new(chunk);
        let result = self.serve_message(stream, pool, &mut msg, &mut chunks.send);
        chunks.recv = Some(msg.into_chunk());
        result
    }

    fn serve_message(
        &self,
        stream: &mut TcpStream,
        pool: &ChunkPool,
        msg: &mut WireMsg,
        send_chunk: &mut Option<MemChunk>,
    ) -> Result<()> {
        let size = msg.read_from(stream, self.binding.max_msg_size(), &self.peer)?;
        self.binding.stats().record_received(size);
        let (frame, body) = msg.decode()?;

        match frame.frame_type {
            FrameType::GlueMsg => {}
            FrameType::Echo => {
                let reply =
                    WireFrame::new(FrameType::EchoResponse, frame.format, false, frame.request_id);
                return self.write_frame(stream, pool, send_chunk, &reply, None);
            }
            FrameType::Heartbeat | FrameType::EchoResponse | FrameType::Dummy => {
                trace!("Ignoring {:?} frame from {}", frame.frame_type, self.peer);
                return Ok(());
            }
        }

        let codec = self.binding.codec();
        if frame.format != codec.format() {
            return Err(TransportError::protocol(format!(
                "payload format {} does not match binding format {}",
                frame.format,
                codec.format()
            )));
        }

        let request_id = frame.request_id;
        let one_way = frame.one_way;
        let response = match codec.deserialize(body) {
            Ok(payload) => {
                let request = RequestMsg {
                    request_id,
                    one_way,
                    headers: frame.headers,
                    payload,
                };
                handle_request_guarded(self.dispatcher.as_ref(), request, &self.peer)
            }
            Err(e) if e.corrupted_state => return Err(e.into()),
            Err(e) => {
                let e = anyhow::Error::new(e);
                error!("Unable to deserialize request {} from {}: {}", request_id, self.peer, e);
                self.dispatcher.handle_request_failure(request_id, one_way, &e, &self.peer)
            }
        };
        if one_way {
            return Ok(());
        }

        match self.write_response(stream, pool, send_chunk, &response) {
            Err(e) if !e.closes_channel() => {
                warn!(
                    "Response {} to {} could not be sent, sending failure instead: {}",
                    request_id, self.peer, e
                );
                let e = anyhow::Error::new(e);
                let fallback =
                    self.dispatcher.handle_request_failure(request_id, false, &e, &self.peer);
                self.write_response(stream, pool, send_chunk, &fallback)
            }
            other => other,
        }
    }

    fn write_response(
        &self,
        stream: &mut TcpStream,
        pool: &ChunkPool,
        send_chunk: &mut Option<MemChunk>,
        response: &ResponseMsg,
    ) -> Result<()> {
        let format = self.binding.codec().format();
        let frame = WireFrame::new(FrameType::GlueMsg, format, false, response.request_id)
            .with_headers(response.headers.clone());
        self.write_frame(stream, pool, send_chunk, &frame, Some(&response.payload))
    }

    fn write_frame(
        &self,
        stream: &mut TcpStream,
        pool: &ChunkPool,
        send_chunk: &mut Option<MemChunk>,
        frame: &WireFrame,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let chunk = send_chunk.take().unwrap_or_else(|| pool.acquire_or_create());
        let mut msg = WireMsg::new(chunk);
        let max = self.binding.max_msg_size();
        let encoded = match payload {
            Some(payload) => msg.encode_payload(frame, self.binding.codec().as_ref(), payload, max),
            None => msg.encode(frame, max, |_| Ok(())),
        };
        let written = encoded.and_then(|size| {
            stream
                .write_all(msg.as_bytes())
                .map(|_| size)
                .map_err(|e| TransportError::communication(&self.peer, e))
        });
        *send_chunk = Some(msg.into_chunk());

        let size = written?;
        trace!(
            "Wrote {:?} {} ({} bytes) to {}",
            frame.frame_type,
            frame.request_id,
            size,
            self.peer
        );
        self.binding.stats().record_sent(size);
        Ok(())
    }
}

impl ServerTransport for SyncServerTransport {
    fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn close(&self) {
        self.handle.close();
    }
}
