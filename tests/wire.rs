use std::io::Cursor;

use glue_rpc::pool::{ChunkPool, ChunkPoolConfig};
use glue_rpc::protocol::wire::{
    ClientSite, Deserialize, FrameType, Serialize, WireFrame, WireMsg, CLIENT_SITE_MAGIC,
    FRAME_FIXED_SIZE, MAX_HEADERS_LENGTH, SIZE_PREFIX_LEN,
};
use glue_rpc::{Direction, RawCodec, TransportError};

fn frame_bytes(frame: &WireFrame) -> Vec<u8> {
    let mut buf = Vec::new();
    frame.serialize(&mut buf).expect("serialize frame");
    buf
}

fn glue_frame(one_way: bool, request_id: u64) -> WireFrame {
    WireFrame::new(FrameType::GlueMsg, 0, one_way, request_id)
}

fn fresh_msg() -> WireMsg {
    WireMsg::new(ChunkPool::new(ChunkPoolConfig::default()).acquire_or_create())
}

#[test]
fn frame_layout_is_big_endian() {
    let frame = WireFrame::new(FrameType::Echo, 7, true, 0x0102_0304_0506_0708)
        .with_headers(Some("ab".into()));
    let bytes = frame_bytes(&frame);

    assert_eq!(
        bytes,
        vec![
            0xAB, 0xBA, // magic
            1,    // version
            2,    // type
            0, 0, 0, 7, // format
            1, // oneWay
            1, 2, 3, 4, 5, 6, 7, 8, // requestId
            0, 0, 0, 2, // headersLen
            b'a', b'b',
        ]
    );
    assert_eq!(frame.length(), bytes.len());
}

#[test]
fn frame_without_headers_uses_minus_one() {
    let bytes = frame_bytes(&WireFrame::new(FrameType::GlueMsg, 0, false, 1));
    assert_eq!(bytes.len(), FRAME_FIXED_SIZE);
    assert_eq!(&bytes[FRAME_FIXED_SIZE - 4..], &(-1_i32).to_be_bytes());

    let decoded = WireFrame::deserialize(&mut bytes.as_slice()).expect("decode frame");
    assert_eq!(decoded.headers, None);
}

#[test]
fn frame_round_trips_empty_headers() {
    let frame = WireFrame::new(FrameType::GlueMsg, 3, false, 99).with_headers(Some(String::new()));
    let bytes = frame_bytes(&frame);
    let decoded = WireFrame::deserialize(&mut bytes.as_slice()).expect("decode frame");
    assert_eq!(decoded, frame);
}

#[test]
fn frame_rejects_bad_magic_and_version() {
    let mut bytes = frame_bytes(&WireFrame::new(FrameType::GlueMsg, 0, false, 1));
    bytes[0] = 0xAA;
    let err = WireFrame::deserialize(&mut bytes.as_slice()).expect_err("bad magic accepted");
    assert!(err.closes_channel());
    assert!(err.to_string().contains("magic"), "unexpected error: {err}");

    let mut bytes = frame_bytes(&WireFrame::new(FrameType::GlueMsg, 0, false, 1));
    bytes[2] = 2;
    let err = WireFrame::deserialize(&mut bytes.as_slice()).expect_err("bad version accepted");
    assert!(err.closes_channel());
    assert!(err.to_string().contains("version"), "unexpected error: {err}");
}

#[test]
fn frame_rejects_unknown_type_and_oneway_flag() {
    let mut bytes = frame_bytes(&WireFrame::new(FrameType::GlueMsg, 0, false, 1));
    bytes[3] = 9;
    assert!(WireFrame::deserialize(&mut bytes.as_slice()).is_err());

    let mut bytes = frame_bytes(&WireFrame::new(FrameType::GlueMsg, 0, false, 1));
    bytes[8] = 2;
    assert!(WireFrame::deserialize(&mut bytes.as_slice()).is_err());
}

#[test]
fn frame_rejects_oversized_headers_before_reading_them() {
    let mut bytes = frame_bytes(&WireFrame::new(FrameType::GlueMsg, 0, false, 1));
    let len = (MAX_HEADERS_LENGTH + 1) as i32;
    bytes[FRAME_FIXED_SIZE - 4..].copy_from_slice(&len.to_be_bytes());

    let err =
        WireFrame::deserialize(&mut bytes.as_slice()).expect_err("oversized headers accepted");
    assert!(matches!(
        err,
        TransportError::Protocol {
            close_channel: true,
            ..
        }
    ));

    let mut bytes = frame_bytes(&WireFrame::new(FrameType::GlueMsg, 0, false, 1));
    bytes[FRAME_FIXED_SIZE - 4..].copy_from_slice(&(-2_i32).to_be_bytes());
    assert!(WireFrame::deserialize(&mut bytes.as_slice()).is_err());
}

#[test]
fn serializing_oversized_headers_fails() {
    let frame = glue_frame(false, 1).with_headers(Some("x".repeat(MAX_HEADERS_LENGTH + 1)));
    let mut buf = Vec::new();
    assert!(frame.serialize(&mut buf).is_err());
}

#[test]
fn message_prefix_counts_itself() {
    let mut msg = fresh_msg();
    let frame = WireFrame::new(FrameType::GlueMsg, 0, false, 5);
    let size = msg.encode_payload(&frame, &RawCodec, b"hello", 1024).expect("encode");

    assert_eq!(size, SIZE_PREFIX_LEN + FRAME_FIXED_SIZE + 5);
    assert_eq!(msg.total_size(), size);
    assert_eq!(&msg.as_bytes()[..4], &(size as i32).to_be_bytes());

    let (decoded, body) = msg.decode().expect("decode");
    assert_eq!(decoded, frame);
    assert_eq!(body, b"hello");
}

#[test]
fn oversized_outbound_message_is_rejected_before_any_byte_is_produced() {
    let mut msg = fresh_msg();
    let frame = WireFrame::new(FrameType::GlueMsg, 0, false, 11);
    let err = msg
        .encode_payload(&frame, &RawCodec, &[0_u8; 200], 100)
        .expect_err("oversized message accepted");

    match err {
        TransportError::MessageSize {
            direction,
            size,
            max,
            request_id,
        } => {
            assert_eq!(direction, Direction::Outbound);
            assert_eq!(size, SIZE_PREFIX_LEN + FRAME_FIXED_SIZE + 200);
            assert_eq!(max, 100);
            assert_eq!(request_id, Some(11));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(msg.as_bytes().is_empty());
}

#[test]
fn read_from_stops_at_one_message() {
    let mut first = fresh_msg();
    first
        .encode_payload(&glue_frame(false, 1), &RawCodec, b"one", 1024)
        .expect("encode");
    let mut second = fresh_msg();
    second
        .encode_payload(&glue_frame(true, 2), &RawCodec, b"two", 1024)
        .expect("encode");

    let mut stream = Vec::new();
    stream.extend_from_slice(first.as_bytes());
    stream.extend_from_slice(second.as_bytes());
    let mut src = Cursor::new(stream);

    let mut incoming = fresh_msg();
    incoming.read_from(&mut src, 1024, "test").expect("read first");
    let (frame, body) = incoming.decode().expect("decode first");
    assert_eq!((frame.request_id, body), (1, &b"one"[..]));

    incoming.read_from(&mut src, 1024, "test").expect("read second");
    let (frame, body) = incoming.decode().expect("decode second");
    assert_eq!((frame.request_id, frame.one_way, body), (2, true, &b"two"[..]));
}

#[test]
fn read_from_rejects_declared_sizes_out_of_range() {
    let mut incoming = fresh_msg();
    let err = incoming
        .read_from(&mut Cursor::new(4096_i32.to_be_bytes().to_vec()), 1024, "test")
        .expect_err("oversized inbound accepted");
    assert!(matches!(
        err,
        TransportError::MessageSize {
            direction: Direction::Inbound,
            size: 4096,
            ..
        }
    ));
    assert!(err.closes_channel());

    let err = incoming
        .read_from(&mut Cursor::new(8_i32.to_be_bytes().to_vec()), 1024, "test")
        .expect_err("undersized inbound accepted");
    assert!(matches!(
        err,
        TransportError::Protocol {
            close_channel: true,
            ..
        }
    ));
}

#[test]
fn client_site_layout() {
    let guid = [0x11_u8; 16];
    let site = ClientSite::new("host-a", guid).expect("valid site");
    let bytes = site.to_bytes();

    assert_eq!(bytes.len(), site.wire_length());
    assert_eq!(&bytes[..2], &((4 + 2 + 6 + 16) as i16).to_be_bytes());
    assert_eq!(&bytes[2..6], &CLIENT_SITE_MAGIC.to_be_bytes());
    assert_eq!(&bytes[6..8], &6_i16.to_be_bytes());
    assert_eq!(&bytes[8..14], b"host-a");
    assert_eq!(&bytes[14..], &guid);

    let decoded = ClientSite::deserialize(&mut bytes.as_slice()).expect("decode site");
    assert_eq!(decoded, site);
}

#[test]
fn client_site_rejects_bad_magic_and_host_names() {
    let mut bytes = ClientSite::new("host-a", [0; 16]).expect("valid site").to_bytes();
    bytes[2] = 0;
    assert!(ClientSite::deserialize(&mut bytes.as_slice()).is_err());

    assert!(ClientSite::new("", [0; 16]).is_err());
    assert!(ClientSite::new("h".repeat(1025), [0; 16]).is_err());
    assert!(ClientSite::new("h".repeat(1024), [0; 16]).is_ok());
}

#[test]
fn local_client_sites_are_distinct() {
    let a = ClientSite::local();
    let b = ClientSite::local();
    assert!(!a.host_name().is_empty());
    assert_ne!(a.app_instance(), b.app_instance());
}
