//! Request/response envelopes and per-call bookkeeping.
//!
//! Payloads are opaque: the transport frames them and hands them to the
//! binding's codec, it never looks inside.

use std::time::{Duration, SystemTime};

/// A request travelling from a client to a server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestMsg {
    /// Correlation id, echoed back by the response.
    pub request_id: u64,
    /// Oneway requests never get a response.
    pub one_way: bool,
    /// Optional out-of-band headers carried in the frame.
    pub headers: Option<String>,
    pub payload: Vec<u8>,
}

impl RequestMsg {
    pub fn new(request_id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            one_way: false,
            headers: None,
            payload: payload.into(),
        }
    }

    pub fn one_way(request_id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            one_way: true,
            headers: None,
            payload: payload.into(),
        }
    }

    pub fn with_headers(mut self, headers: impl Into<String>) -> Self {
        self.headers = Some(headers.into());
        self
    }
}

/// A response travelling back to the client that issued the request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMsg {
    pub request_id: u64,
    pub headers: Option<String>,
    pub payload: Vec<u8>,
    /// Set by the client transport when the response was read off the wire
    /// (or returned by an in-process server).
    pub arrival: Option<SystemTime>,
}

impl ResponseMsg {
    pub fn new(request_id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            headers: None,
            payload: payload.into(),
            arrival: None,
        }
    }

    pub(crate) fn arrived(mut self) -> Self {
        self.arrival = Some(SystemTime::now());
        self
    }
}

/// Per-call timeouts. `None` falls back to the binding's client-side
/// `snd-timeout`/`rcv-timeout`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub dispatch_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// Oneway request written to the transport.
    Dispatched,
    /// Two-way request written; the response will arrive asynchronously.
    Pending,
    /// Two-way request answered.
    ResponseOK,
}

/// Outcome of a send on a client transport.
#[derive(Clone, Debug)]
pub struct CallSlot {
    request_id: u64,
    one_way: bool,
    status: CallStatus,
    response: Option<ResponseMsg>,
}

impl CallSlot {
    pub(crate) fn dispatched(request_id: u64) -> Self {
        Self {
            request_id,
            one_way: true,
            status: CallStatus::Dispatched,
            response: None,
        }
    }

    pub(crate) fn pending(request_id: u64) -> Self {
        Self {
            request_id,
            one_way: false,
            status: CallStatus::Pending,
            response: None,
        }
    }

    pub(crate) fn completed(response: ResponseMsg) -> Self {
        Self {
            request_id: response.request_id,
            one_way: false,
            status: CallStatus::ResponseOK,
            response: Some(response),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn response(&self) -> Option<&ResponseMsg> {
        self.response.as_ref()
    }

    pub fn into_response(self) -> Option<ResponseMsg> {
        self.response
    }
}
