//! Transport boundary: duplex text-frame connections and reconnect policy.
//!
//! The pipeline only needs [`FrameSource::receive`] and [`FrameSink::send`].
//! A [`Connector`] opens a fresh pair per connection attempt; [`WsConnector`]
//! does so over `tokio-tungstenite`, and [`crate::memory`] provides an
//! in-process implementation for tests and replay.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use cx_core::config::ReconnectSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("connection closed")]
    Closed,
}

/// Inbound half of a connection.
#[async_trait::async_trait]
pub trait FrameSource: Send + 'static {
    /// Next text frame. `Ok(None)` means the peer closed the connection.
    async fn receive(&mut self) -> Result<Option<String>, TransportError>;
}

/// Outbound half of a connection.
#[async_trait::async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;
}

/// Opens connections. Called once per (re)connect attempt.
#[async_trait::async_trait]
pub trait Connector: Send + 'static {
    type Source: FrameSource;
    type Sink: FrameSink;

    async fn connect(&mut self) -> Result<(Self::Source, Self::Sink), TransportError>;

    /// Endpoint description for logs.
    fn endpoint(&self) -> &str;
}

/// Connection state published by the session supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected yet.
    Idle,
    /// Successfully connected to the remote endpoint.
    Connected,
    /// Disconnected from the remote endpoint.
    Disconnected {
        /// Human-readable reason for disconnection.
        reason: String,
    },
    /// Waiting before the next connect attempt.
    Reconnecting {
        /// Consecutive failed attempts so far (1-based).
        attempt: u32,
    },
    /// Reconnection has permanently failed.
    Failed {
        /// Human-readable reason for failure.
        reason: String,
    },
}

/// Reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Backoff is capped at this value (before jitter).
    pub max_backoff: Duration,
    /// Give up after this many consecutive failed attempts (0 = unlimited).
    pub max_retries: u32,
    /// Emit a warning log after this many consecutive failures.
    pub alert_after: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_retries: 0, // unlimited
            alert_after: 5,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(s: &ReconnectSettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
            max_retries: s.max_retries,
            ..Self::default()
        }
    }
}

impl ReconnectConfig {
    /// `true` once `failures` consecutive failed attempts exhaust the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_retries > 0 && failures > self.max_retries
    }

    /// Delay before attempt number `failures + 1`.
    pub fn delay(&self, failures: u32) -> Duration {
        calculate_backoff(
            &self.initial_backoff,
            &self.max_backoff,
            failures.saturating_sub(1),
        )
    }
}

/// Calculate exponential backoff with jitter.
///
/// `backoff = initial * 2^attempt`, capped at `max`. Jitter adds a random
/// amount in `[0, 0.5 * backoff]`.
pub(crate) fn calculate_backoff(initial: &Duration, max: &Duration, attempt: u32) -> Duration {
    let base = initial
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(*max);

    let jitter_frac = rand::random::<f64>() * 0.5;
    let jitter = Duration::from_secs_f64(base.as_secs_f64() * jitter_frac);

    base + jitter
}

// ── WebSocket implementation ───────────────────────────────────────────

/// Opens `tokio-tungstenite` connections to a fixed URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    type Source = WsSource;
    type Sink = WsSink;

    async fn connect(&mut self) -> Result<(WsSource, WsSink), TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(url = %self.url, "connected to WebSocket");
        let (sink, stream) = stream.split();
        Ok((WsSource { stream }, WsSink { sink }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Read half of a WebSocket connection.
pub struct WsSource {
    stream: SplitStream<WsStream>,
}

#[async_trait::async_trait]
impl FrameSource for WsSource {
    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text)),
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => tracing::debug!("dropping non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(?frame, "peer closed WebSocket");
                    return Ok(None);
                }
                // Protocol pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Read(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Write half of a WebSocket connection.
pub struct WsSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}
