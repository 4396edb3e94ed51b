use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::site::{PendingResponse, SiteRegistry};
use super::socket::SiteSocket;
use super::{shutdown_requested, MAINTENANCE_DRAIN_SPINS, SEND_DRAIN_SPINS};
use crate::binding::{Binding, TransportFamily};
use crate::config::socket_timeout;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TransportError};
use crate::message::{RequestMsg, ResponseMsg};
use crate::node::Node;
use crate::pool::ChunkPool;
use crate::protocol::wire::{
    ClientSite, Deserialize, FrameType, WireFrame, WireMsg, MAX_HOST_NAME_BYTES,
};
use crate::transport::{ConnectionHandle, ConnectionRole, ConnectionState, ServerTransport};

const LISTEN_BACKLOG: u32 = 1024;
/// Longest legal handshake body: magic, host length, host name and GUID.
const MAX_HANDSHAKE_BODY: usize = 4 + 2 + MAX_HOST_NAME_BYTES + 16;

/// What one maintenance pass did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub closed_sockets: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub evicted_sites: usize,
    pub evicted_chunks: usize,
}

/// State shared by the listener, its connection tasks and maintenance.
struct Context {
    binding: Arc<Binding>,
    dispatcher: Arc<dyn Dispatcher>,
    sites: Arc<SiteRegistry>,
}

/// Multiplexed listener.
pub struct MpxServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<Context>,
}

impl MpxServer {
    /// Binds to `addr` ("ip:port"). The server side buffer sizes are applied
    /// to the listening socket and inherited by accepted sockets.
    pub async fn bind(
        binding: Arc<Binding>,
        addr: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<MpxServer> {
        binding.ensure_ready(TransportFamily::Mpx)?;
        let sock_addr = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| TransportError::communication(addr, e))?
            .next()
            .ok_or_else(|| {
                let e = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind");
                TransportError::communication(addr, e)
            })?;

        let listener =
            listen(&binding, sock_addr).map_err(|e| TransportError::communication(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::communication(addr, e))?;
        info!("Listening on {:?}", local_addr);
        let context = Context {
            binding,
            dispatcher,
            sites: Arc::new(SiteRegistry::new()),
        };
        Ok(MpxServer {
            listener,
            local_addr,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node(&self) -> Node {
        Node::from(self.local_addr)
    }

    pub fn sites(&self) -> &Arc<SiteRegistry> {
        &self.context.sites
    }

    /// Accepts connections until the listener fails, serving each one on its
    /// own task. Connections arriving while the binding is stopped are refused.
    pub async fn handle_forever(&self) -> io::Result<()> {
        loop {
            let (socket, addr) = self.listener.accept().await?;
            let binding = &self.context.binding;
            if !binding.is_started() {
                info!(
                    "Refusing connection from {}, binding '{}' is stopped",
                    addr,
                    binding.name()
                );
                drop(socket);
                continue;
            }
            let peer = addr.to_string();
            info!("Accepting connection from {}", peer);
            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(e) = process_socket(context, socket, peer).await {
                    debug!("Connection loop broken due to {:?}", e);
                }
            });
        }
    }

    /// Closes idle sockets, drains every site, evicts empty sites and runs the
    /// binding's own maintenance.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.context.run_maintenance(Instant::now())
    }

    /// Runs [`run_maintenance`](Self::run_maintenance) every
    /// `maintenance-interval` until the binding is stopped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let context = self.context.clone();
        tokio::spawn(async move {
            let period = context.binding.config().maintenance_interval;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !context.binding.is_started() {
                    debug!("Binding '{}' stopped, maintenance ends", context.binding.name());
                    return;
                }
                let report = context.run_maintenance(Instant::now());
                if report != MaintenanceReport::default() {
                    debug!("Maintenance: {:?}", report);
                }
            }
        })
    }
}

fn listen(binding: &Binding, addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let server = binding.server_config();
    socket.set_reuseaddr(true)?;
    socket.set_recv_buffer_size(server.rcv_buf_size as u32)?;
    socket.set_send_buffer_size(server.snd_buf_size as u32)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

impl Context {
    fn run_maintenance(&self, now: Instant) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let idle = socket_timeout(self.binding.config().server_transport_idle_timeout);
        for state in self.sites.all() {
            if let Some(idle) = idle {
                report.closed_sockets += state.close_idle_sockets(now, idle);
            }
            if let Some(drained) = state.drain(MAINTENANCE_DRAIN_SPINS) {
                report.delivered += drained.delivered;
                report.requeued += drained.requeued;
                report.dropped += drained.dropped;
            }
        }
        for _ in 0..report.dropped {
            self.binding.stats().record_dropped_response();
        }
        report.evicted_sites = self.sites.evict_idle();
        report.evicted_chunks = self.binding.run_maintenance();
        report
    }
}

/// Reads the client site handshake that opens every multiplexed connection.
async fn read_client_site(socket: &mut TcpStream) -> Result<ClientSite> {
    let mut prefix = [0_u8; 2];
    socket
        .read_exact(&mut prefix)
        .await
        .map_err(|e| TransportError::protocol(format!("truncated client site: {e}")))?;
    let declared = i16::from_be_bytes(prefix);
    if declared <= 0 || declared as usize > MAX_HANDSHAKE_BODY {
        return Err(TransportError::protocol(format!(
            "invalid client site length {declared}"
        )));
    }

    let mut handshake = vec![0_u8; 2 + declared as usize];
    handshake[..2].copy_from_slice(&prefix);
    socket
        .read_exact(&mut handshake[2..])
        .await
        .map_err(|e| TransportError::protocol(format!("truncated client site: {e}")))?;
    ClientSite::deserialize(&mut handshake.as_slice())
}

async fn process_socket(
    context: Arc<Context>,
    mut socket: TcpStream,
    peer: String,
) -> anyhow::Result<()> {
    let binding = context.binding.clone();
    let _ = socket.set_nodelay(true);

    let site = match socket_timeout(binding.server_config().rcv_timeout) {
        Some(limit) => timeout(limit, read_client_site(&mut socket))
            .await
            .map_err(|_| {
                TransportError::protocol(format!("no client site handshake from {peer}"))
            })??,
        None => read_client_site(&mut socket).await?,
    };
    debug!("{} introduced itself as {}", peer, site);

    let handle = binding.register_connection(ConnectionRole::Server, peer.clone());
    handle.set_state(ConnectionState::Active);
    let (outbound, outbound_rx) = mpsc::channel(binding.config().mpx_socket_queue_capacity);
    let socket_entry = Arc::new(SiteSocket::with_handle(handle.clone(), outbound));
    let state = context.sites.register(&site, socket_entry.clone());

    let (reader, writer) = socket.into_split();
    let writer_task = tokio::spawn(write_loop(
        binding.clone(),
        writer,
        outbound_rx,
        handle.clone(),
        context.sites.clone(),
        site.clone(),
    ));
    let transport = Arc::new(MpxServerTransport {
        binding: binding.clone(),
        dispatcher: context.dispatcher.clone(),
        sites: context.sites.clone(),
        site: site.clone(),
        socket: socket_entry.clone(),
        peer: peer.clone(),
    });

    let result = read_loop(&context, reader, &transport, &handle).await;
    if result.is_err() {
        handle.set_state(ConnectionState::Error);
    }
    state.remove_socket(socket_entry.id());
    binding.deregister_connection(&handle);
    if let Err(e) = writer_task.await {
        error!("Writer task for {} failed: {}", peer, e);
    }
    // Responses stranded on this socket move to the site's other sockets.
    let drained = context
        .sites
        .get(&site)
        .and_then(|state| state.drain(MAINTENANCE_DRAIN_SPINS));
    if let Some(report) = drained {
        for _ in 0..report.dropped {
            binding.stats().record_dropped_response();
        }
    }
    info!("Connection from {} closed", peer);
    result.map_err(anyhow::Error::from)
}

async fn read_loop(
    context: &Context,
    mut reader: OwnedReadHalf,
    transport: &Arc<MpxServerTransport>,
    handle: &ConnectionHandle,
) -> Result<()> {
    let binding = &context.binding;
    let pool = binding.chunk_pool()?;
    let max_msg_size = binding.max_msg_size();
    let closed = shutdown_requested(handle.subscribe());
    tokio::pin!(closed);

    let mut msg = WireMsg::new(pool.acquire_or_create());
    let result = loop {
        let read = tokio::select! {
            _ = &mut closed => break Ok(()),
            read = msg.read_from_async(&mut reader, max_msg_size, &transport.peer) => read,
        };
        match read.and_then(|size| transport.process_message(context, &pool, &msg, size)) {
            Ok(()) => {}
            Err(TransportError::Communication { source, .. })
                if source.kind() == io::ErrorKind::UnexpectedEof =>
            {
                debug!("{} closed the connection", transport.peer);
                break Ok(());
            }
            Err(e) => {
                binding.stats().record_error();
                if e.closes_channel() {
                    warn!("Closing connection from {}: {}", transport.peer, e);
                    break Err(e);
                }
                warn!("Message from {} failed: {}", transport.peer, e);
            }
        }
    };
    pool.release(msg.into_chunk());
    result
}

/// Writes queued responses until the connection closes. Whatever is still
/// queued afterwards goes back to the site.
async fn write_loop(
    binding: Arc<Binding>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<PendingResponse>,
    handle: Arc<ConnectionHandle>,
    sites: Arc<SiteRegistry>,
    site: ClientSite,
) {
    let write_timeout = socket_timeout(binding.server_config().snd_timeout);
    let closed = shutdown_requested(handle.subscribe());
    tokio::pin!(closed);

    loop {
        let pending = tokio::select! {
            _ = &mut closed => break,
            next = outbound.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };

        let write = writer.write_all(pending.msg.as_bytes());
        let written = match write_timeout {
            Some(limit) => timeout(limit, write).await.unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::TimedOut, "response write timed out"))
            }),
            None => write.await,
        };
        match written {
            Ok(()) => {
                trace!("Wrote response {} to {}", pending.request_id, handle.peer());
                binding.stats().record_sent(pending.msg.total_size());
                binding.release_chunk(pending.msg.into_chunk());
            }
            Err(e) => {
                warn!(
                    "Writing response {} to {} failed: {}",
                    pending.request_id,
                    handle.peer(),
                    e
                );
                binding.stats().record_error();
                handle.set_state(ConnectionState::Error);
                handle.close();
                sites.requeue(&site, pending);
                break;
            }
        }
    }

    outbound.close();
    while let Ok(pending) = outbound.try_recv() {
        sites.requeue(&site, pending);
    }
}

/// Response path of one accepted multiplexed socket.
///
/// Responses are queued on the client site, not on this socket: they reach
/// the client through whichever of its sockets is alive. The site state is
/// looked up on every send, so a response produced after the site was evicted
/// still reaches a socket the client opened since.
pub struct MpxServerTransport {
    binding: Arc<Binding>,
    dispatcher: Arc<dyn Dispatcher>,
    sites: Arc<SiteRegistry>,
    site: ClientSite,
    socket: Arc<SiteSocket>,
    peer: String,
}

impl MpxServerTransport {
    pub fn client_site(&self) -> &ClientSite {
        &self.site
    }

    fn process_message(
        self: &Arc<Self>,
        context: &Context,
        pool: &ChunkPool,
        msg: &WireMsg,
        size: usize,
    ) -> Result<()> {
        self.binding.stats().record_received(size);
        self.socket.touch();
        let (frame, body) = msg.decode()?;

        match frame.frame_type {
            FrameType::GlueMsg => {}
            FrameType::Echo => return self.answer_echo(pool, &frame),
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
        match codec.deserialize(body) {
            Ok(payload) => {
                let request = RequestMsg {
                    request_id,
                    one_way,
                    headers: frame.headers,
                    payload,
                };
                let transport: Arc<dyn ServerTransport> = self.clone();
                context.dispatcher.dispatch_request(request, transport);
            }
            Err(e) if e.corrupted_state => return Err(e.into()),
            Err(e) => {
                let e = anyhow::Error::new(e);
                error!("Unable to deserialize request {} from {}: {}", request_id, self.peer, e);
                let failure =
                    self.dispatcher.handle_request_failure(request_id, one_way, &e, &self.peer);
                if !one_way {
                    self.send_response(failure);
                }
            }
        }
        Ok(())
    }

    /// Echo replies go out on the socket the echo came in on.
    fn answer_echo(&self, pool: &ChunkPool, echo: &WireFrame) -> Result<()> {
        let reply = WireFrame::new(FrameType::EchoResponse, echo.format, false, echo.request_id);
        let mut msg = WireMsg::new(pool.acquire_or_create());
        if let Err(e) = msg.encode(&reply, self.binding.max_msg_size(), |_| Ok(())) {
            pool.release(msg.into_chunk());
            return Err(e);
        }
        let pending = PendingResponse {
            request_id: echo.request_id,
            msg,
        };
        if let Err(e) = self.socket.try_send(pending) {
            debug!("Echo response {} to {} not queued: {}", echo.request_id, self.peer, e);
        }
        Ok(())
    }

    fn encode_response(&self, pool: &ChunkPool, response: &ResponseMsg) -> Result<WireMsg> {
        let codec = self.binding.codec();
        let frame = WireFrame::new(FrameType::GlueMsg, codec.format(), false, response.request_id)
            .with_headers(response.headers.clone());
        let mut msg = WireMsg::new(pool.acquire_or_create());
        let max_msg_size = self.binding.max_msg_size();
        match msg.encode_payload(&frame, codec.as_ref(), &response.payload, max_msg_size) {
            Ok(_) => Ok(msg),
            Err(e) => {
                pool.release(msg.into_chunk());
                Err(e)
            }
        }
    }
}

impl ServerTransport for MpxServerTransport {
    fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    /// Encodes the response, queues it on the client site and tries to drain
    /// the site right away. Returns false only when nothing could be queued.
    fn send_response(&self, response: ResponseMsg) -> bool {
        let pool = match self.binding.chunk_pool() {
            Ok(pool) => pool,
            Err(e) => {
                warn!("Response {} to {} discarded: {}", response.request_id, self.peer, e);
                return false;
            }
        };

        let request_id = response.request_id;
        let msg = match self.encode_response(&pool, &response) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Unable to encode response {} to {}: {}", request_id, self.peer, e);
                self.binding.stats().record_error();
                let e = anyhow::Error::new(e);
                let failure =
                    self.dispatcher.handle_request_failure(request_id, false, &e, &self.peer);
                match self.encode_response(&pool, &failure) {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!(
                            "Unable to encode failure response {} to {}: {}",
                            request_id, self.peer, e
                        );
                        return false;
                    }
                }
            }
        };

        let state = self.sites.enqueue(&self.site, PendingResponse { request_id, msg });
        if let Some(report) = state.drain(SEND_DRAIN_SPINS) {
            for _ in 0..report.dropped {
                self.binding.stats().record_dropped_response();
            }
        }
        true
    }

    fn close(&self) {
        self.socket.close();
    }
}
