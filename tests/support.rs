#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;

use glue_rpc::{
    Binding, BindingConfig, CallOptions, Dispatcher, RawCodec, RequestMsg, ResponseMsg,
    TransportFamily,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Started binding with the default configuration and the raw codec.
pub fn binding(family: TransportFamily) -> Arc<Binding> {
    binding_with(family, BindingConfig::default())
}

pub fn binding_with(family: TransportFamily, config: BindingConfig) -> Arc<Binding> {
    init_tracing();
    let binding =
        Binding::new("test", family, config, Arc::new(RawCodec)).expect("valid binding config");
    binding.start().expect("start binding");
    binding
}

pub fn call_options() -> CallOptions {
    CallOptions {
        dispatch_timeout: Some(Duration::from_secs(5)),
        receive_timeout: Some(Duration::from_secs(5)),
    }
}

/// Serves a tiny command set:
///
/// - `ping` answers `pong`
/// - `fail` returns an error
/// - `panic` panics
/// - anything else is echoed back
///
/// Request headers are echoed on the response.
#[derive(Default)]
pub struct EchoDispatcher {
    calls: AtomicUsize,
    seen: Mutex<Vec<u64>>,
}

impl EchoDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request ids in the order they were served.
    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().expect("unable to lock seen ids").clone()
    }
}

impl Dispatcher for EchoDispatcher {
    fn handle_request(&self, request: RequestMsg) -> anyhow::Result<ResponseMsg> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("unable to lock seen ids")
            .push(request.request_id);

        let payload = match request.payload.as_slice() {
            b"ping" => b"pong".to_vec(),
            b"fail" => return Err(anyhow!("requested failure")),
            b"panic" => panic!("requested panic"),
            other => other.to_vec(),
        };
        let mut response = ResponseMsg::new(request.request_id, payload);
        response.headers = request.headers;
        Ok(response)
    }

    fn handle_request_failure(
        &self,
        request_id: u64,
        _one_way: bool,
        error: &anyhow::Error,
        _context: &str,
    ) -> ResponseMsg {
        ResponseMsg::new(request_id, format!("failure: {error}"))
    }
}

/// Client side sink forwarding every asynchronous response into a channel.
pub struct ChannelDispatcher {
    responses: mpsc::UnboundedSender<ResponseMsg>,
}

impl ChannelDispatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ResponseMsg>) {
        let (responses, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { responses }), rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn handle_request(&self, _request: RequestMsg) -> anyhow::Result<ResponseMsg> {
        Err(anyhow!("client sink does not serve requests"))
    }

    fn handle_request_failure(
        &self,
        request_id: u64,
        _one_way: bool,
        error: &anyhow::Error,
        _context: &str,
    ) -> ResponseMsg {
        ResponseMsg::new(request_id, error.to_string())
    }

    fn deliver_async_response(&self, response: ResponseMsg) {
        let _ = self.responses.send(response);
    }
}
