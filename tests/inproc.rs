use std::sync::Arc;

mod support;

use glue_rpc::transport::inproc::{InProcClientTransport, InProcServerTransport};
use glue_rpc::{
    Binding, CallStatus, ClientTransport, Node, RequestMsg, ServerTransport, TransportError,
    TransportFamily,
};

use support::{binding, call_options, EchoDispatcher};

fn open(binding: &Arc<Binding>, node: Node) -> Arc<InProcServerTransport> {
    InProcServerTransport::open(binding.clone(), node, EchoDispatcher::new()).expect("open server")
}

#[test]
fn calls_reach_the_server_of_an_identical_node() {
    let binding = binding(TransportFamily::InProc);
    let dispatcher = EchoDispatcher::new();
    let _server = InProcServerTransport::open(
        binding.clone(),
        Node::new("Local", "glue"),
        dispatcher.clone(),
    )
    .expect("open server");
    let mut client =
        InProcClientTransport::new(binding, Node::new("local", "glue")).expect("client");

    let slot = client
        .send_request(RequestMsg::new(7, "ping"), &call_options())
        .expect("call");
    assert_eq!(slot.status(), CallStatus::ResponseOK);
    let response = slot.into_response().expect("response");
    assert_eq!(response.payload, b"pong");
    assert!(response.arrival.is_some());

    let slot = client
        .send_request(RequestMsg::one_way(8, "note"), &call_options())
        .expect("oneway");
    assert_eq!(slot.status(), CallStatus::Dispatched);
    assert!(slot.response().is_none());
    assert_eq!(dispatcher.seen(), vec![7, 8]);
}

#[test]
fn failures_come_back_as_failure_responses() {
    let binding = binding(TransportFamily::InProc);
    let node = Node::new("local", "glue");
    let _server = open(&binding, node.clone());
    let mut client = InProcClientTransport::new(binding, node).expect("client");

    let slot = client
        .send_request(RequestMsg::new(1, "fail"), &call_options())
        .expect("call");
    assert_eq!(
        slot.into_response().expect("response").payload,
        b"failure: requested failure"
    );
}

#[test]
fn calls_without_a_server_fail() {
    let binding = binding(TransportFamily::InProc);
    let node = Node::new("local", "glue");
    let server = open(&binding, node.clone());
    let mut client = InProcClientTransport::new(binding.clone(), Node::new("elsewhere", "glue"))
        .expect("client");
    assert!(matches!(
        client.send_request(RequestMsg::new(1, "ping"), &call_options()),
        Err(TransportError::NoServer(_))
    ));

    let mut client = InProcClientTransport::new(binding, node).expect("client");
    server.close();
    assert!(!server.is_open());
    assert!(matches!(
        client.send_request(RequestMsg::new(2, "ping"), &call_options()),
        Err(TransportError::NoServer(_))
    ));
}

#[test]
fn one_server_per_node() {
    let binding = binding(TransportFamily::InProc);
    let node = Node::new("local", "glue");
    let first = open(&binding, node.clone());
    let duplicate = InProcServerTransport::open(
        binding.clone(),
        Node::new("LOCAL", "glue"),
        EchoDispatcher::new(),
    );
    assert!(duplicate.is_err());

    first.close();
    let reopened = open(&binding, node);
    assert!(reopened.is_open());
}
