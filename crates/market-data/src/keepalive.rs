//! Ping/pong keepalive.
//!
//! The exchange pings periodically and drops connections that stay silent.
//! Each ping is answered with a pong echoing the ping's fields, pushed onto
//! the shared request queue like any other outbound message.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cexio::message::Request;
use crate::cexio::types::Envelope;
use crate::pipeline::forward;

#[derive(Debug, Clone)]
pub struct KeepaliveResponder {
    requests: mpsc::Sender<Request>,
}

impl KeepaliveResponder {
    pub fn new(requests: mpsc::Sender<Request>) -> Self {
        Self { requests }
    }

    /// Pong for `ping`. Only the tag changes.
    pub fn pong_for(ping: Envelope) -> Request {
        Request::Pong(ping)
    }

    /// Queue the pong. Returns `false` if the request queue is gone or
    /// shutdown started while waiting for space.
    pub async fn respond(&self, ping: Envelope, cancel: &CancellationToken) -> bool {
        tracing::debug!(time = ?ping.time, "answering ping");
        forward(&self.requests, Self::pong_for(ping), cancel).await
    }
}
