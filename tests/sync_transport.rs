use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod support;

use glue_rpc::transport::sync::{SyncClientTransport, SyncServer};
use glue_rpc::{
    Binding, BindingConfig, CallSlot, CallStatus, ClientTransport, Direction, MessageCodec, Node,
    RawCodec, RequestMsg, SerializationError, TransportError, TransportFamily,
};

use support::{binding, binding_with, call_options, EchoDispatcher};

fn start_server(config: BindingConfig) -> (Arc<Binding>, SyncServer, Arc<EchoDispatcher>) {
    let server_binding = binding_with(TransportFamily::Sync, config);
    let dispatcher = EchoDispatcher::new();
    let server = SyncServer::bind(server_binding.clone(), "127.0.0.1:0", dispatcher.clone())
        .expect("bind server");
    server.start().expect("start server");
    (server_binding, server, dispatcher)
}

fn client_for(server: &SyncServer) -> SyncClientTransport {
    SyncClientTransport::new(binding(TransportFamily::Sync), server.node()).expect("create client")
}

fn call(client: &mut SyncClientTransport, request: RequestMsg, what: &str) -> CallSlot {
    client.send_request(request, &call_options()).expect(what)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Asserts the server hangs up without answering.
fn expect_hang_up(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    let mut buf = [0_u8; 16];
    match stream.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("server answered {n} bytes"),
    }
}

#[test]
fn oneway_request_resolves_as_dispatched() {
    let (_server_binding, server, dispatcher) = start_server(BindingConfig::default());
    let mut client = client_for(&server);

    let slot = call(&mut client, RequestMsg::one_way(42, "note"), "send oneway");
    assert_eq!(slot.status(), CallStatus::Dispatched);
    assert_eq!(slot.request_id(), 42);
    assert!(slot.is_one_way());
    assert!(slot.response().is_none());

    wait_until("oneway request to be served", || dispatcher.seen() == vec![42]);
}

#[test]
fn two_way_request_gets_its_response() {
    let (_server_binding, server, _dispatcher) = start_server(BindingConfig::default());
    let mut client = client_for(&server);

    let request = RequestMsg::new(7, "ping").with_headers("trace=1");
    let slot = call(&mut client, request, "send ping");
    assert_eq!(slot.status(), CallStatus::ResponseOK);

    let response = slot.into_response().expect("response");
    assert_eq!(response.request_id, 7);
    assert_eq!(response.payload, b"pong");
    assert_eq!(response.headers.as_deref(), Some("trace=1"));
    assert!(response.arrival.is_some());
}

#[test]
fn requests_share_one_connection() {
    let (server_binding, server, dispatcher) = start_server(BindingConfig::default());
    let mut client = client_for(&server);

    call(&mut client, RequestMsg::one_way(1, "a"), "send oneway");
    for id in 2..=4 {
        let slot = call(&mut client, RequestMsg::new(id, "ping"), "send ping");
        assert_eq!(slot.response().map(|r| r.request_id), Some(id));
    }
    assert_eq!(dispatcher.seen(), vec![1, 2, 3, 4]);
    assert_eq!(server_binding.open_connections(), 1);
}

#[test]
fn oversized_request_fails_without_touching_the_connection() {
    let mut config = BindingConfig::default();
    config.max_msg_size = 1024;
    let (_server_binding, server, dispatcher) = start_server(config.clone());
    let client_binding = binding_with(TransportFamily::Sync, config);
    let mut client = SyncClientTransport::new(client_binding, server.node()).expect("client");

    call(&mut client, RequestMsg::new(1, "ping"), "first ping");
    assert!(client.is_connected());

    let err = client
        .send_request(RequestMsg::new(2, vec![0_u8; 2000]), &call_options())
        .expect_err("oversized request accepted");
    assert!(
        matches!(
            err,
            TransportError::MessageSize {
                direction: Direction::Outbound,
                request_id: Some(2),
                ..
            }
        ),
        "unexpected error: {err:?}"
    );
    assert!(client.is_connected());

    let slot = call(&mut client, RequestMsg::new(3, "ping"), "ping after oversize");
    assert_eq!(
        slot.response().map(|r| r.payload.as_slice()),
        Some(&b"pong"[..])
    );
    assert_eq!(dispatcher.seen(), vec![1, 3]);
}

#[test]
fn oversized_headers_close_the_connection_without_dispatch() {
    let (server_binding, server, dispatcher) = start_server(BindingConfig::default());
    let mut stream = TcpStream::connect(server.local_addr()).expect("connect");

    let mut msg = Vec::new();
    msg.extend_from_slice(&25_i32.to_be_bytes());
    msg.extend_from_slice(&0xABBA_u16.to_be_bytes());
    msg.push(1); // version
    msg.push(0); // GlueMsg
    msg.extend_from_slice(&0_i32.to_be_bytes());
    msg.push(0);
    msg.extend_from_slice(&9_u64.to_be_bytes());
    msg.extend_from_slice(&5_000_000_i32.to_be_bytes());
    stream.write_all(&msg).expect("write frame");

    expect_hang_up(&mut stream);
    wait_until("server connection to close", || {
        server_binding.open_connections() == 0
    });
    assert_eq!(dispatcher.calls(), 0);
}

#[test]
fn dispatcher_errors_and_panics_become_failure_responses() {
    let (_server_binding, server, _dispatcher) = start_server(BindingConfig::default());
    let mut client = client_for(&server);

    let slot = call(&mut client, RequestMsg::new(1, "fail"), "send fail");
    let payload = slot.into_response().expect("response").payload;
    assert_eq!(String::from_utf8_lossy(&payload), "failure: requested failure");

    let slot = call(&mut client, RequestMsg::new(2, "panic"), "send panic");
    let payload = String::from_utf8(slot.into_response().expect("response").payload).expect("utf8");
    assert!(payload.contains("requested panic"), "unexpected payload {payload}");

    let slot = call(&mut client, RequestMsg::new(3, "ping"), "ping after panic");
    assert_eq!(slot.response().map(|r| r.request_id), Some(3));
}

#[test]
fn echo_round_trip() {
    let (_server_binding, server, dispatcher) = start_server(BindingConfig::default());
    let mut client = client_for(&server);

    client.echo(&call_options()).expect("first echo");
    client.echo(&call_options()).expect("second echo");
    assert_eq!(dispatcher.calls(), 0);
}

#[test]
fn client_reconnects_after_the_server_drops_it() {
    let (server_binding, server, _dispatcher) = start_server(BindingConfig::default());
    let mut client = client_for(&server);
    call(&mut client, RequestMsg::new(1, "ping"), "first ping");

    server_binding.wait_for_complete_stop();
    server_binding.start().expect("restart server binding");

    let err = client
        .send_request(RequestMsg::new(2, "ping"), &call_options())
        .expect_err("call on a dropped connection succeeded");
    assert!(err.is_communication(), "unexpected error: {err:?}");
    assert!(!client.is_connected());

    let slot = call(&mut client, RequestMsg::new(3, "ping"), "ping after reconnect");
    assert_eq!(slot.response().map(|r| r.request_id), Some(3));
}

#[test]
fn stopped_binding_refuses_connections() {
    let (server_binding, server, dispatcher) = start_server(BindingConfig::default());
    server_binding.wait_for_complete_stop();

    let mut stream = TcpStream::connect(server.local_addr()).expect("connect");
    expect_hang_up(&mut stream);
    assert_eq!(server_binding.open_connections(), 0);
    assert_eq!(dispatcher.calls(), 0);
}

#[test]
fn idle_server_connections_are_closed() {
    let mut config = BindingConfig::default();
    config.server_transport_idle_timeout = Duration::from_millis(200);
    config.idle_poll_interval = Duration::from_millis(20);
    let (server_binding, server, _dispatcher) = start_server(config);
    let mut client = client_for(&server);

    call(&mut client, RequestMsg::new(1, "ping"), "ping");
    assert_eq!(server_binding.open_connections(), 1);
    wait_until("idle connection to close", || {
        server_binding.open_connections() == 0
    });
}

/// Codec tagging its frames with a format the raw codec does not speak.
struct TaggedCodec;

impl MessageCodec for TaggedCodec {
    fn format(&self) -> i32 {
        9
    }

    fn name(&self) -> &str {
        "tagged"
    }

    fn serialize(&self, payload: &[u8], dest: &mut Vec<u8>) -> Result<(), SerializationError> {
        dest.extend_from_slice(payload);
        Ok(())
    }

    fn deserialize(&self, src: &[u8]) -> Result<Vec<u8>, SerializationError> {
        Ok(src.to_vec())
    }
}

#[test]
fn server_rejects_foreign_payload_format() {
    let (server_binding, server, dispatcher) = start_server(BindingConfig::default());
    let config = BindingConfig::default();
    let codec = Arc::new(TaggedCodec);
    let client_binding =
        Binding::new("tagged", TransportFamily::Sync, config, codec).expect("binding");
    client_binding.start().expect("start");
    let mut client = SyncClientTransport::new(client_binding, server.node()).expect("client");

    let err = client
        .send_request(RequestMsg::new(1, "ping"), &call_options())
        .expect_err("foreign format accepted");
    assert!(err.closes_channel(), "unexpected error: {err:?}");
    wait_until("server connection to close", || {
        server_binding.open_connections() == 0
    });
    assert_eq!(dispatcher.calls(), 0);
}

#[test]
fn clients_refuse_unstarted_or_foreign_bindings() {
    let config = BindingConfig::default();
    let unstarted = Binding::new("cold", TransportFamily::Sync, config, Arc::new(RawCodec))
        .expect("binding");
    let node = Node::new("127.0.0.1", "1");
    assert!(matches!(
        SyncClientTransport::new(unstarted, node.clone()),
        Err(TransportError::NotStarted(_))
    ));
    assert!(matches!(
        SyncClientTransport::new(binding(TransportFamily::Mpx), node),
        Err(TransportError::WrongFamily { .. })
    ));
}
