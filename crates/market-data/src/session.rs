//! Client session: wires the pipeline together and keeps it connected.
//!
//! [`MarketDataClient::start`] spawns the long-lived stages (encoder, router,
//! response handler, book engine) and a supervisor. The supervisor owns the
//! [`Connector`]: per connection it spawns a writer and runs the reader
//! until the connection ends, then backs off and reconnects. A drop resets
//! the books. On every reconnect, frames encoded for the dead connection are
//! discarded, the auth handshake is repeated if it was requested before, and
//! every active subscription is re-sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use cx_core::config::AppConfig;
use cx_core::types::{BookSnapshot, Pair};

use crate::cexio::auth::Authenticator;
use crate::cexio::message::{Inbound, Request};
use crate::engine::{BookEngine, BookEvent, BookHandle, EngineCommand, EngineSettings};
use crate::keepalive::KeepaliveResponder;
use crate::pipeline::{
    forward, run_encoder, run_reader, run_response_handler, run_router, run_writer, ReaderExit,
    Routes, SharedFrames,
};
use crate::ws::{ConnectionState, Connector, ReconnectConfig};

/// Buffered snapshots per broadcast subscriber before it starts lagging.
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("gave up on {endpoint} after {attempts} consecutive failed connection attempts")]
    RetriesExhausted { endpoint: String, attempts: u32 },
    #[error("no API credentials configured")]
    MissingCredentials,
    #[error("session is shut down")]
    Closed,
}

/// Everything the session needs besides the connector.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub engine: EngineSettings,
    /// Capacity of every bounded stage queue.
    pub queue_capacity: usize,
    /// Ticker poll period per subscription, `None` to disable.
    pub ticker_interval: Option<Duration>,
    pub reconnect: ReconnectConfig,
    pub credentials: Option<Authenticator>,
    pub snapshot_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            queue_capacity: 16,
            ticker_interval: None,
            reconnect: ReconnectConfig::default(),
            credentials: None,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
        }
    }
}

impl SessionSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let md = &cfg.market_data;
        let credentials = (!cfg.exchange.api_key.is_empty())
            .then(|| Authenticator::new(cfg.exchange.api_key.clone(), &cfg.exchange.api_secret));
        Self {
            engine: EngineSettings {
                depth: md.book_depth,
                subscribe_depth: md.subscribe_depth,
                auto_resync: md.auto_resync,
            },
            queue_capacity: md.queue_capacity,
            ticker_interval: md.ticker_interval(),
            reconnect: ReconnectConfig::from(&md.reconnect),
            credentials,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
        }
    }
}

/// Receivers and tasks handed to the caller alongside the client.
pub struct SessionHandles {
    /// Book lifecycle notifications.
    pub events: mpsc::UnboundedReceiver<BookEvent>,
    /// Order-management replies. Dropping this discards them.
    pub orders: mpsc::Receiver<Inbound>,
    /// Connection supervisor. Resolves on shutdown or once reconnects are
    /// exhausted.
    pub supervisor: JoinHandle<Result<(), SessionError>>,
}

/// One active subscription and its ticker poll.
struct Subscription {
    poll: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop the poll. Its task winds down on its own.
    fn stop(self) {
        self.poll.cancel();
    }
}

/// State shared between the client and the supervisor.
struct Shared {
    authenticator: Option<Authenticator>,
    /// Set once the caller asked for authentication; replayed on reconnect.
    authenticated: AtomicBool,
    subscriptions: Mutex<HashMap<Pair, Subscription>>,
}

impl Shared {
    fn subscribed_pairs(&self) -> Vec<Pair> {
        let mut pairs: Vec<Pair> = self.subscriptions.lock().keys().cloned().collect();
        pairs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        pairs
    }
}

/// Caller-facing handle of a running session.
pub struct MarketDataClient {
    requests: mpsc::Sender<Request>,
    control: mpsc::UnboundedSender<EngineCommand>,
    shared: Arc<Shared>,
    books: BookHandle,
    snapshots: broadcast::Sender<BookSnapshot>,
    state: watch::Receiver<ConnectionState>,
    subscribe_depth: u32,
    ticker_interval: Option<Duration>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MarketDataClient {
    /// Spawn the pipeline on the current runtime. Connecting starts
    /// immediately; requests issued before the first connection are queued.
    pub fn start<C: Connector>(
        connector: C,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> (Self, SessionHandles) {
        let capacity = settings.queue_capacity.max(1);
        let (requests_tx, requests_rx) = mpsc::channel(capacity);
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (book_responses_tx, book_responses_rx) = mpsc::channel(capacity);
        let (book_updates_tx, book_updates_rx) = mpsc::channel(capacity);
        let (orders_tx, orders_rx) = mpsc::channel(capacity);
        let (responses_tx, responses_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = broadcast::channel(settings.snapshot_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let engine = BookEngine::new(
            settings.engine.clone(),
            requests_tx.clone(),
            events_tx,
            snapshots.clone(),
        );
        let books = engine.handle();

        let routes = Routes {
            book_responses: book_responses_tx,
            book_updates: book_updates_tx,
            orders: orders_tx,
            responses: responses_tx,
        };
        let workers = vec![
            tokio::spawn(run_encoder(requests_rx, frames_tx, cancel.clone())),
            tokio::spawn(run_router(inbound_rx, routes, cancel.clone())),
            tokio::spawn(run_response_handler(
                responses_rx,
                KeepaliveResponder::new(requests_tx.clone()),
                cancel.clone(),
            )),
            tokio::spawn(engine.run(control_rx, book_responses_rx, book_updates_rx, cancel.clone())),
        ];

        let shared = Arc::new(Shared {
            authenticator: settings.credentials.clone(),
            authenticated: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
        });

        let supervisor = Supervisor {
            connector,
            replay: Replay {
                shared: Arc::clone(&shared),
                subscribe_depth: settings.engine.subscribe_depth,
                requests: requests_tx.clone(),
                control: control_tx.clone(),
                cancel: cancel.clone(),
            },
            reconnect: settings.reconnect.clone(),
            inbound: inbound_tx,
            frames: Arc::new(tokio::sync::Mutex::new(frames_rx)),
            state: state_tx,
            cancel: cancel.clone(),
        };
        let supervisor = tokio::spawn(supervisor.run());

        let client = Self {
            requests: requests_tx,
            control: control_tx,
            shared,
            books,
            snapshots,
            state: state_rx,
            subscribe_depth: settings.engine.subscribe_depth,
            ticker_interval: settings.ticker_interval,
            workers: Mutex::new(workers),
            cancel,
        };
        let handles = SessionHandles {
            events: events_rx,
            orders: orders_rx,
            supervisor,
        };
        (client, handles)
    }

    /// Send the signed handshake now and after every reconnect.
    pub async fn authenticate(&self) -> Result<(), SessionError> {
        let auth = self
            .shared
            .authenticator
            .as_ref()
            .ok_or(SessionError::MissingCredentials)?;
        self.shared.authenticated.store(true, Ordering::SeqCst);
        tracing::info!("authenticating");
        self.send(auth.build_auth_request()).await
    }

    /// Subscribe to `pair`: request a snapshot plus deltas and start the
    /// ticker poll. Subscribing to an active pair requests a fresh snapshot.
    pub async fn subscribe(&self, pair: Pair) -> Result<(), SessionError> {
        self.control
            .send(EngineCommand::Track(pair.clone()))
            .map_err(|_| SessionError::Closed)?;

        let poll = self.cancel.child_token();
        let task = self.ticker_interval.map(|period| {
            tokio::spawn(poll_ticker(pair.clone(), period, self.requests.clone(), poll.clone()))
        });
        let previous = self
            .shared
            .subscriptions
            .lock()
            .insert(pair.clone(), Subscription { poll, task });
        if let Some(previous) = previous {
            previous.stop();
        }

        tracing::info!(pair = %pair, depth = self.subscribe_depth, "subscribing");
        self.send(Request::Subscribe {
            pair,
            depth: self.subscribe_depth,
        })
        .await
    }

    /// Drop the subscription. The book is removed immediately and the pair is
    /// not restored after a reconnect.
    pub async fn unsubscribe(&self, pair: &Pair) -> Result<(), SessionError> {
        let removed = self.shared.subscriptions.lock().remove(pair);
        if let Some(removed) = removed {
            removed.stop();
        }
        self.control
            .send(EngineCommand::Release(pair.clone()))
            .map_err(|_| SessionError::Closed)?;
        tracing::info!(pair = %pair, "unsubscribing");
        self.send(Request::Unsubscribe { pair: pair.clone() }).await
    }

    /// One-shot ticker request outside the periodic poll.
    pub async fn request_ticker(&self, pair: &Pair) -> Result<(), SessionError> {
        self.send(Request::Ticker { pair: pair.clone() }).await
    }

    /// Live books.
    pub fn books(&self) -> BookHandle {
        self.books.clone()
    }

    /// Every book change, published as a full copy.
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<BookSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn subscriptions(&self) -> Vec<Pair> {
        self.shared.subscribed_pairs()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Cancel every stage and wait for the tasks to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut workers = std::mem::take(&mut *self.workers.lock());
        workers.extend(
            self.shared
                .subscriptions
                .lock()
                .values_mut()
                .filter_map(|sub| sub.task.take()),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        tracing::info!("market data session shut down");
    }

    async fn send(&self, request: Request) -> Result<(), SessionError> {
        if forward(&self.requests, request, &self.cancel).await {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

async fn poll_ticker(
    pair: Pair,
    period: Duration,
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if !forward(&requests, Request::Ticker { pair: pair.clone() }, &cancel).await {
            break;
        }
    }
    tracing::debug!(pair = %pair, "ticker poll stopped");
}

/// Drop frames encoded while no connection was up. They target the previous
/// session state and would reach the exchange ahead of the replayed
/// handshake.
async fn discard_stale_frames(frames: &SharedFrames) {
    let mut frames = frames.lock().await;
    let mut dropped = 0usize;
    while frames.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, "stale frames discarded before restore");
    }
}

/// What a fresh connection needs to pick up where the last one stopped.
struct Replay {
    shared: Arc<Shared>,
    subscribe_depth: u32,
    requests: mpsc::Sender<Request>,
    control: mpsc::UnboundedSender<EngineCommand>,
    cancel: CancellationToken,
}

impl Replay {
    /// Replay the handshake and subscriptions.
    async fn restore(&self) {
        if self.shared.authenticated.load(Ordering::SeqCst) {
            if let Some(auth) = &self.shared.authenticator {
                if !forward(&self.requests, auth.build_auth_request(), &self.cancel).await {
                    return;
                }
            }
        }
        let pairs = self.shared.subscribed_pairs();
        tracing::info!(pairs = pairs.len(), "restoring subscriptions");
        for pair in pairs {
            let _ = self.control.send(EngineCommand::Track(pair.clone()));
            let request = Request::Subscribe {
                pair,
                depth: self.subscribe_depth,
            };
            if !forward(&self.requests, request, &self.cancel).await {
                return;
            }
        }
    }

    /// Invalidate every book and whatever `connection` still has queued.
    fn reset_books(&self, connection: u64) {
        let _ = self.control.send(EngineCommand::Reset { connection });
    }
}

struct Supervisor<C> {
    connector: C,
    replay: Replay,
    reconnect: ReconnectConfig,
    inbound: mpsc::Sender<Inbound>,
    frames: SharedFrames,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) -> Result<(), SessionError> {
        let endpoint = self.connector.endpoint().to_string();
        let mut failures: u32 = 0;
        let mut connections: u64 = 0;

        loop {
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                r = self.connector.connect() => r,
            };

            match connected {
                Ok((source, sink)) => {
                    failures = 0;
                    connections += 1;
                    self.state.send_replace(ConnectionState::Connected);
                    tracing::info!(endpoint = %endpoint, connection = connections, "connected");

                    if connections > 1 {
                        discard_stale_frames(&self.frames).await;
                    }
                    let conn = self.cancel.child_token();
                    let writer = tokio::spawn(run_writer(sink, Arc::clone(&self.frames), conn.clone()));
                    if connections > 1 {
                        self.replay.restore().await;
                    }
                    let exit = run_reader(source, self.inbound.clone(), connections, conn.clone()).await;
                    conn.cancel();
                    if let Err(e) = writer.await {
                        tracing::warn!(error = %e, "writer task ended abnormally");
                    }

                    let reason = match exit {
                        ReaderExit::Cancelled => return Ok(()),
                        ReaderExit::InboundClosed => return Err(SessionError::Closed),
                        ReaderExit::Closed => "closed by peer".to_string(),
                        ReaderExit::Failed(e) => e.to_string(),
                    };
                    tracing::warn!(endpoint = %endpoint, reason = %reason, "disconnected");
                    self.state
                        .send_replace(ConnectionState::Disconnected { reason });
                    self.replay.reset_books(connections);
                    // First retry after a drop waits the initial backoff.
                    failures = 1;
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(endpoint = %endpoint, attempt = failures, error = %e, "connect failed");
                    if self.reconnect.exhausted(failures) {
                        let err = SessionError::RetriesExhausted {
                            endpoint: endpoint.clone(),
                            attempts: failures,
                        };
                        tracing::error!(error = %err, "giving up");
                        self.state.send_replace(ConnectionState::Failed {
                            reason: err.to_string(),
                        });
                        self.cancel.cancel();
                        return Err(err);
                    }
                    if failures >= self.reconnect.alert_after {
                        tracing::warn!(
                            endpoint = %endpoint,
                            consecutive_failures = failures,
                            "ALERT: repeated connection failures"
                        );
                    }
                }
            }

            let delay = self.reconnect.delay(failures);
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt: failures });
            tracing::info!(
                endpoint = %endpoint,
                attempt = failures,
                backoff_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
