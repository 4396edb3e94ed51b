//! In-process transport: calls go straight into a server registered on the
//! same binding, on the calling thread, without sockets or serialization.
//!
//! The oneway/two-way contract is kept so callers stay binding-agnostic:
//! oneway calls still reach the dispatcher but resolve as `Dispatched`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use super::{ClientTransport, ServerTransport};
use crate::binding::{Binding, TransportFamily};
use crate::dispatch::{handle_request_guarded, Dispatcher};
use crate::error::{Result, TransportError};
use crate::message::{CallOptions, CallSlot, RequestMsg};
use crate::node::Node;

/// Server endpoint reachable by in-process clients of the same binding.
pub struct InProcServerTransport {
    binding: Arc<Binding>,
    node: Node,
    peer: String,
    dispatcher: Arc<dyn Dispatcher>,
    open: AtomicBool,
}

impl InProcServerTransport {
    /// Registers a server for `node` on `binding`. Fails if another server
    /// already answers for an identical node.
    pub fn open(
        binding: Arc<Binding>,
        node: Node,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Arc<Self>> {
        binding.ensure_ready(TransportFamily::InProc)?;
        let server = Arc::new(Self {
            peer: format!("inproc://{node}"),
            binding: binding.clone(),
            node,
            dispatcher,
            open: AtomicBool::new(true),
        });
        binding.register_inproc_server(server.clone())?;
        debug!("In-process server open for {}", server.node);
        Ok(server)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl ServerTransport for InProcServerTransport {
    fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.binding.deregister_inproc_server(&self.node);
            debug!("In-process server closed for {}", self.node);
        }
    }
}

pub struct InProcClientTransport {
    binding: Arc<Binding>,
    node: Node,
}

impl InProcClientTransport {
    pub fn new(binding: Arc<Binding>, node: Node) -> Result<Self> {
        binding.ensure_ready(TransportFamily::InProc)?;
        Ok(Self { binding, node })
    }
}

impl ClientTransport for InProcClientTransport {
    fn node(&self) -> &Node {
        &self.node
    }

    fn send_request(&mut self, request: RequestMsg, _options: &CallOptions) -> Result<CallSlot> {
        let server = self
            .binding
            .find_inproc_server(&self.node)
            .filter(|s| s.is_open())
            .ok_or_else(|| TransportError::NoServer(self.node.clone()))?;

        let request_id = request.request_id;
        let one_way = request.one_way;
        trace!("In-process call {} to {}", request_id, self.node);
        self.binding.stats().record_sent(request.payload.len());
        let response = handle_request_guarded(server.dispatcher.as_ref(), request, server.peer());

        if one_way {
            return Ok(CallSlot::dispatched(request_id));
        }
        self.binding.stats().record_received(response.payload.len());
        Ok(CallSlot::completed(response.arrived()))
    }

    fn close(&mut self) {}
}
