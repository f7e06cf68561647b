//! In-process transport over channels.
//!
//! [`memory_transport`] returns the client-side halves plus a [`MemoryPeer`]
//! that plays the exchange: it pushes frames to the client and reads what the
//! client wrote. [`MemoryConnector`] hands out queued transports one per
//! connect call, which is enough to script reconnects.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::ws::{Connector, FrameSink, FrameSource, TransportError};

/// Client-side read half.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

/// Client-side write half.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
}

/// Exchange side of a memory transport.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

/// Create a connected client/peer pair.
pub fn memory_transport() -> (MemorySource, MemorySink, MemoryPeer) {
    let (to_client, rx) = mpsc::unbounded_channel();
    let (tx, from_client) = mpsc::unbounded_channel();
    (
        MemorySource { rx },
        MemorySink { tx },
        MemoryPeer {
            to_client,
            from_client,
        },
    )
}

impl MemoryPeer {
    /// Deliver a text frame to the client. Returns `false` once the client
    /// side has been dropped.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(Ok(frame.into())).is_ok()
    }

    /// Make the client's next read fail.
    pub fn fail(&self, reason: &str) -> bool {
        self.to_client
            .send(Err(TransportError::Read(reason.to_string())))
            .is_ok()
    }

    /// Next frame written by the client, `None` once its sink is dropped.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Close the connection from the exchange side. The client reads `None`.
    pub fn close(self) {}
}

#[async_trait::async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Connector that replays a fixed list of transports.
#[derive(Default)]
pub struct MemoryConnector {
    pending: VecDeque<Result<(MemorySource, MemorySink), TransportError>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport and return its peer.
    pub fn accept(&mut self) -> MemoryPeer {
        let (source, sink, peer) = memory_transport();
        self.pending.push_back(Ok((source, sink)));
        peer
    }

    /// Queue a failed connect attempt.
    pub fn refuse(&mut self, reason: &str) {
        self.pending.push_back(Err(TransportError::Connect {
            url: "memory".to_string(),
            reason: reason.to_string(),
        }));
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    type Source = MemorySource;
    type Sink = MemorySink;

    async fn connect(&mut self) -> Result<(MemorySource, MemorySink), TransportError> {
        self.pending.pop_front().unwrap_or_else(|| {
            Err(TransportError::Connect {
                url: "memory".to_string(),
                reason: "no more scripted connections".to_string(),
            })
        })
    }

    fn endpoint(&self) -> &str {
        "memory"
    }
}
