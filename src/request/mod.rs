//! Request / response correlation on top of a channel.
//!
//! A request is an ordinary message whose sequence number the sender remembers; the peer's
//!  answer carries that number as its `sseq`. Pending requests live in a fixed size ring indexed
//!  by `seq % capacity`, so the number of requests in flight per channel is bounded. Messages with
//!  `sseq == 0` are requests (or one-way messages) from the peer and go to the registered
//!  handlers, whose return value is sent back as the response.
//!
//! Requests fail with a `RequestError` value, they never panic or error across the await:
//!  timeouts, capacity evictions and closing the connection all complete the request.

use std::time::Duration;
use crate::codec::envelope::EnvelopeFlags;

pub mod client;
mod correlation;
pub mod handlers;
pub mod server;
mod window;

pub use client::ReqClient;
pub use handlers::{HandlerRegistry, HandlerReply, RequestHandler};
pub use server::ReqServer;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("too many outstanding requests")]
    TooManyOutstanding,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("sending the request failed: {0}")]
    SendFailed(String),
    #[error("a response to a newer request arrived first")]
    Evicted,
    #[error("the response could not be decoded: {0}")]
    InvalidResponse(String),
}

impl RequestError {
    /// Evicted requests count as timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout | RequestError::Evicted)
    }
}

/// The peer's answer to a request
#[derive(Debug)]
pub struct Response<M> {
    pub msg_type: u32,
    pub flags: EnvelopeFlags,
    /// the responder's sequence number
    pub seq: u32,
    /// the request's sequence number
    pub sseq: u32,
    pub message: M,
    rtt: Duration,
}

impl<M> Response<M> {
    /// Time between sending the request and receiving the response
    pub fn rtt(&self) -> Duration {
        self.rtt
    }
}

/// A message from the peer, as seen by a handler
#[derive(Debug)]
pub struct IncomingRequest<M> {
    pub msg_type: u32,
    pub flags: EnvelopeFlags,
    pub seq: u32,
    pub message: M,
}

pub type RequestResult<M> = Result<Response<M>, RequestError>;
