//! Bindings: configuration holder and factory context for one transport family.
//!
//! A [`Binding`] owns everything its transports share: the configuration, the
//! payload codec, the chunk pool, traffic counters, the handles of every open
//! connection and the in-process servers registered on it. Transports are
//! created against an `Arc<Binding>`:
//!
//! ```ignore
//! let config = BindingConfig::default();
//! let binding = Binding::new("glue", TransportFamily::Sync, config, Arc::new(RawCodec))?;
//! binding.start()?;
//! let mut client = SyncClientTransport::new(binding.clone(), Node::parse("127.0.0.1:7700")?)?;
//! ```
//!
//! [`Binding::start`] allocates the chunk pool; [`Binding::wait_for_complete_stop`]
//! closes every open connection and releases the pool. A stopped binding can be
//! started again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::codec::MessageCodec;
use crate::config::{BindingConfig, SideConfig};
use crate::error::{Result, TransportError};
use crate::node::Node;
use crate::pool::{ChunkPool, ChunkPoolConfig, MemChunk};
use crate::stats::TransportStats;
use crate::transport::inproc::InProcServerTransport;
use crate::transport::{ConnectionHandle, ConnectionRole, ConnectionState};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransportFamily {
    Sync,
    Mpx,
    InProc,
}

impl TransportFamily {
    pub fn operation_flow(self) -> OperationFlow {
        match self {
            TransportFamily::Sync | TransportFamily::InProc => OperationFlow::Synchronous,
            TransportFamily::Mpx => OperationFlow::Asynchronous,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransportFamily::Sync => "sync",
            TransportFamily::Mpx => "mpx",
            TransportFamily::InProc => "inproc",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationFlow {
    Synchronous,
    Asynchronous,
}

pub struct Binding {
    name: String,
    family: TransportFamily,
    config: BindingConfig,
    codec: Arc<dyn MessageCodec>,
    pool: RwLock<Option<Arc<ChunkPool>>>,
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
    inproc_servers: Mutex<Vec<Arc<InProcServerTransport>>>,
    next_connection_id: AtomicU64,
    stats: TransportStats,
}

impl Binding {
    pub fn new(
        name: impl Into<String>,
        family: TransportFamily,
        config: BindingConfig,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Arc<Binding>> {
        config.validate()?;
        Ok(Arc::new(Binding {
            name: name.into(),
            family,
            config,
            codec,
            pool: RwLock::new(None),
            connections: Mutex::new(HashMap::new()),
            inproc_servers: Mutex::new(Vec::new()),
            next_connection_id: AtomicU64::new(1),
            stats: TransportStats::default(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> TransportFamily {
        self.family
    }

    pub fn operation_flow(&self) -> OperationFlow {
        self.family.operation_flow()
    }

    /// Name of the codec in use.
    pub fn encoding_format(&self) -> &str {
        self.codec.name()
    }

    pub fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.codec
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    pub fn max_msg_size(&self) -> usize {
        self.config.max_msg_size
    }

    pub fn client_config(&self) -> &SideConfig {
        &self.config.client
    }

    pub fn server_config(&self) -> &SideConfig {
        &self.config.server
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Two nodes are identical when their connect strings match ignoring case.
    pub fn are_nodes_identical(&self, left: &Node, right: &Node) -> bool {
        left.connect_string().eq_ignore_ascii_case(&right.connect_string())
    }

    /// Allocates the shared chunk pool. Starting a started binding is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut pool = self.pool.write().expect("unable to lock binding pool");
        if pool.is_none() {
            let config = ChunkPoolConfig::from_binding(&self.config);
            *pool = Some(Arc::new(ChunkPool::new(config)));
            info!(
                "Binding '{}' started ({} family, {} encoding)",
                self.name,
                self.family.name(),
                self.encoding_format()
            );
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.pool
            .read()
            .expect("unable to lock binding pool")
            .is_some()
    }

    pub fn chunk_pool(&self) -> Result<Arc<ChunkPool>> {
        self.pool
            .read()
            .expect("unable to lock binding pool")
            .clone()
            .ok_or_else(|| TransportError::NotStarted(self.name.clone()))
    }

    /// Returns a chunk to the pool; after a stop the chunk is simply dropped.
    pub(crate) fn release_chunk(&self, chunk: MemChunk) {
        let pool = self.pool.read().expect("unable to lock binding pool");
        if let Some(pool) = pool.as_ref() {
            pool.release(chunk);
        }
    }

    /// Fails unless the binding is started and creates `requested` transports.
    pub(crate) fn ensure_ready(&self, requested: TransportFamily) -> Result<()> {
        if self.family != requested {
            return Err(TransportError::WrongFamily {
                binding: self.name.clone(),
                requested: requested.name(),
            });
        }
        if !self.is_started() {
            return Err(TransportError::NotStarted(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn register_connection(
        &self,
        role: ConnectionRole,
        peer: String,
    ) -> Arc<ConnectionHandle> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(id, role, peer));
        self.connections
            .lock()
            .expect("unable to lock binding connections")
            .insert(id, handle.clone());
        handle
    }

    /// Disposes the connection and forgets it.
    pub(crate) fn deregister_connection(&self, handle: &ConnectionHandle) {
        handle.dispose();
        self.connections
            .lock()
            .expect("unable to lock binding connections")
            .remove(&handle.id());
    }

    /// Number of registered connections that are not disposed yet.
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .expect("unable to lock binding connections")
            .values()
            .filter(|h| h.state() != ConnectionState::Disposed)
            .count()
    }

    pub(crate) fn register_inproc_server(&self, server: Arc<InProcServerTransport>) -> Result<()> {
        let mut servers = self
            .inproc_servers
            .lock()
            .expect("unable to lock in-process servers");
        if servers.iter().any(|s| self.are_nodes_identical(s.node(), server.node())) {
            return Err(TransportError::Config(format!(
                "an in-process server is already registered for {}",
                server.node()
            )));
        }
        servers.push(server);
        Ok(())
    }

    pub(crate) fn deregister_inproc_server(&self, node: &Node) {
        self.inproc_servers
            .lock()
            .expect("unable to lock in-process servers")
            .retain(|s| !self.are_nodes_identical(s.node(), node));
    }

    pub(crate) fn find_inproc_server(&self, node: &Node) -> Option<Arc<InProcServerTransport>> {
        self.inproc_servers
            .lock()
            .expect("unable to lock in-process servers")
            .iter()
            .find(|s| self.are_nodes_identical(s.node(), node))
            .cloned()
    }

    /// Periodic housekeeping: evicts idle pool chunks and forgets disposed
    /// connections. Returns the number of evicted chunks.
    pub fn run_maintenance(&self) -> usize {
        self.connections
            .lock()
            .expect("unable to lock binding connections")
            .retain(|_, h| h.state() != ConnectionState::Disposed);
        let pool = self.pool.read().expect("unable to lock binding pool");
        let evicted = pool.as_ref().map_or(0, |pool| pool.evict_idle());
        drop(pool);
        if evicted > 0 {
            debug!("Binding '{}' evicted {} idle chunks", self.name, evicted);
        }
        evicted
    }

    /// Closes every open connection, unregisters in-process servers and drops
    /// the chunk pool.
    pub fn wait_for_complete_stop(&self) {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .connections
            .lock()
            .expect("unable to lock binding connections")
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in &handles {
            handle.dispose();
        }
        self.inproc_servers
            .lock()
            .expect("unable to lock in-process servers")
            .clear();
        *self.pool.write().expect("unable to lock binding pool") = None;
        info!("Binding '{}' stopped, {} connections closed", self.name, handles.len());
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("family", &self.family)
            .field("encoding", &self.encoding_format())
            .field("started", &self.is_started())
            .finish()
    }
}
