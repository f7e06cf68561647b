//! Book engine: owns every order book and serializes all mutations.
//!
//! The engine is the only writer of the book registry. It consumes two
//! queues fed by the router (responses: snapshots and unsubscribe acks;
//! updates: deltas and tickers) plus a control queue from the client. Polling
//! is biased control, then responses, then updates, so a snapshot that
//! arrived before a delta is always applied first.
//!
//! Each tracked pair is either awaiting a snapshot or live. Deltas for an
//! awaiting pair are dropped; a delta that fails to apply discards the book
//! and moves the pair back to awaiting, optionally re-requesting a snapshot.
//! Other pairs are never affected. Snapshots for pairs nobody tracks are
//! ignored.
//!
//! Control jumps ahead of market data, so a connection reset can overtake
//! frames of that connection still sitting in the queues. Messages carry the
//! connection they arrived on and anything from a reset connection is
//! dropped on arrival.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use cx_core::types::{BookSnapshot, Pair, Timestamp};

use crate::cexio::message::{BookDelta, BookSnapshotMsg, Inbound, Message, Request, TickerUpdate};
use crate::orderbook::{BookError, OrderBook};
use crate::pipeline::forward;

/// Book lifecycle notifications for the client.
#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    /// A snapshot was applied; the book is live at `id`.
    Ready { pair: Pair, id: i64 },
    /// A delta could not be applied. The book was discarded.
    Desync { pair: Pair, error: BookError },
    /// The book was dropped (unsubscribe ack, release or connection reset).
    Removed { pair: Pair },
}

/// Client instructions, processed ahead of any market data.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// A subscribe request is about to be sent for this pair.
    Track(Pair),
    /// The caller unsubscribed; forget the pair.
    Release(Pair),
    /// Connection `connection` was lost. Every book is stale, and so is
    /// any data that connection delivered.
    Reset { connection: u64 },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Levels kept per side.
    pub depth: usize,
    /// Depth requested when resubscribing after a desync.
    pub subscribe_depth: u32,
    /// Re-request a snapshot automatically after a desync.
    pub auto_resync: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            depth: 6,
            subscribe_depth: 5,
            auto_resync: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    Awaiting,
    Live,
}

/// Read-only view of the book registry.
#[derive(Debug, Clone)]
pub struct BookHandle {
    books: Arc<DashMap<Pair, OrderBook>>,
}

impl BookHandle {
    /// Current state of one book, `None` unless it is live.
    pub fn snapshot(&self, pair: &Pair) -> Option<BookSnapshot> {
        self.books.get(pair).map(|book| book.snapshot())
    }

    /// All live books, ordered by pair.
    pub fn snapshots(&self) -> Vec<BookSnapshot> {
        let mut all: Vec<BookSnapshot> = self.books.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.pair.as_str().cmp(b.pair.as_str()));
        all
    }

    pub fn pairs(&self) -> Vec<Pair> {
        let mut pairs: Vec<Pair> = self.books.iter().map(|e| e.key().clone()).collect();
        pairs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        pairs
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

pub struct BookEngine {
    books: Arc<DashMap<Pair, OrderBook>>,
    tracked: HashMap<Pair, PairState>,
    /// Oldest connection whose messages are still applied.
    current_connection: u64,
    settings: EngineSettings,
    requests: mpsc::Sender<Request>,
    events: mpsc::UnboundedSender<BookEvent>,
    published: broadcast::Sender<BookSnapshot>,
}

impl BookEngine {
    pub fn new(
        settings: EngineSettings,
        requests: mpsc::Sender<Request>,
        events: mpsc::UnboundedSender<BookEvent>,
        published: broadcast::Sender<BookSnapshot>,
    ) -> Self {
        Self {
            books: Arc::new(DashMap::new()),
            tracked: HashMap::new(),
            current_connection: 0,
            settings,
            requests,
            events,
            published,
        }
    }

    pub fn handle(&self) -> BookHandle {
        BookHandle {
            books: Arc::clone(&self.books),
        }
    }

    /// Main loop. Returns on cancellation or once a market-data queue closes.
    pub async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<EngineCommand>,
        mut responses: mpsc::Receiver<Inbound>,
        mut updates: mpsc::Receiver<Inbound>,
        cancel: CancellationToken,
    ) {
        tracing::info!(stage = "engine", depth = self.settings.depth, "stage started");
        'outer: loop {
            let outbound = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = control.recv() => self.handle_command(command),
                m = responses.recv() => match m {
                    Some(m) => self.handle_response(m),
                    None => break,
                },
                m = updates.recv() => match m {
                    Some(m) => self.handle_update(m),
                    None => break,
                },
            };
            for request in outbound {
                if !forward(&self.requests, request, &cancel).await {
                    break 'outer;
                }
            }
        }
        tracing::info!(stage = "engine", books = self.books.len(), "stage stopped");
    }

    pub fn handle_command(&mut self, command: EngineCommand) -> Vec<Request> {
        match command {
            EngineCommand::Track(pair) => {
                self.tracked.entry(pair).or_insert(PairState::Awaiting);
            }
            EngineCommand::Release(pair) => {
                self.tracked.remove(&pair);
                self.remove_book(&pair);
            }
            EngineCommand::Reset { connection } => {
                self.current_connection = self.current_connection.max(connection + 1);
                for state in self.tracked.values_mut() {
                    *state = PairState::Awaiting;
                }
                let pairs: Vec<Pair> = self.books.iter().map(|e| e.key().clone()).collect();
                for pair in &pairs {
                    self.remove_book(pair);
                }
                tracing::info!(
                    connection,
                    tracked = self.tracked.len(),
                    "books reset, awaiting snapshots"
                );
            }
        }
        Vec::new()
    }

    /// Snapshots and unsubscribe acks.
    pub fn handle_response(&mut self, inbound: Inbound) -> Vec<Request> {
        if self.is_stale(&inbound) {
            return Vec::new();
        }
        match inbound.message {
            Message::BookSnapshot(snapshot) => self.on_snapshot(snapshot),
            Message::BookUnsubscribed(pair) => self.on_unsubscribed(pair),
            other => tracing::debug!(tag = other.tag(), "unexpected message on book response queue"),
        }
        Vec::new()
    }

    /// Deltas and tickers.
    pub fn handle_update(&mut self, inbound: Inbound) -> Vec<Request> {
        if self.is_stale(&inbound) {
            return Vec::new();
        }
        match inbound.message {
            Message::BookDelta(delta) => self.on_delta(delta, inbound.received_at),
            Message::Ticker(ticker) => {
                self.on_ticker(ticker);
                Vec::new()
            }
            other => {
                tracing::debug!(tag = other.tag(), "unexpected message on book update queue");
                Vec::new()
            }
        }
    }

    fn is_stale(&self, inbound: &Inbound) -> bool {
        let stale = inbound.connection < self.current_connection;
        if stale {
            tracing::debug!(
                tag = inbound.message.tag(),
                connection = inbound.connection,
                "message from a closed connection dropped"
            );
        }
        stale
    }

    fn on_snapshot(&mut self, msg: BookSnapshotMsg) {
        let BookSnapshotMsg { pair, id, bids, asks } = msg;
        if !self.tracked.contains_key(&pair) {
            // Late ack of a subscription the caller already released.
            tracing::debug!(pair = %pair, id, "snapshot for untracked pair ignored");
            return;
        }
        let snapshot = {
            let mut book = self
                .books
                .entry(pair.clone())
                .or_insert_with(|| OrderBook::new(pair.clone(), self.settings.depth));
            book.apply_snapshot(id, &bids, &asks);
            book.snapshot()
        };
        self.tracked.insert(pair.clone(), PairState::Live);
        tracing::info!(pair = %pair, id, bids = bids.len(), asks = asks.len(), "book snapshot applied");
        let _ = self.events.send(BookEvent::Ready { pair, id });
        self.publish(snapshot);
    }

    fn on_unsubscribed(&mut self, pair: Pair) {
        // During a resync the ack precedes the fresh snapshot; keep waiting.
        if self.tracked.get(&pair) == Some(&PairState::Live) {
            self.tracked.remove(&pair);
        }
        tracing::info!(pair = %pair, "book unsubscribed");
        self.remove_book(&pair);
    }

    fn on_delta(&mut self, delta: BookDelta, received_at: Timestamp) -> Vec<Request> {
        match self.tracked.get(&delta.pair) {
            None => {
                tracing::debug!(pair = %delta.pair, id = delta.id, "delta for untracked pair ignored");
                return Vec::new();
            }
            Some(PairState::Awaiting) => {
                tracing::debug!(pair = %delta.pair, id = delta.id, "delta dropped while awaiting snapshot");
                return Vec::new();
            }
            Some(PairState::Live) => {}
        }

        // The registry guard must not outlive this block.
        let applied = match self.books.get_mut(&delta.pair) {
            // Predates the snapshot this book was built from.
            Some(book) if delta.id <= book.id() => {
                tracing::debug!(pair = %delta.pair, id = delta.id, book_id = book.id(), "stale delta ignored");
                return Vec::new();
            }
            Some(mut book) => book
                .apply_update(delta.id, &delta.bids, &delta.asks)
                .map(|()| book.snapshot()),
            None => Err(BookError::NotInitialized),
        };

        match applied {
            Ok(snapshot) => {
                log_latency(&delta, received_at);
                self.publish(snapshot);
                Vec::new()
            }
            Err(error) => self.desync(delta.pair, error),
        }
    }

    fn on_ticker(&mut self, update: TickerUpdate) {
        let snapshot = match self.books.get_mut(&update.pair) {
            Some(mut book) => {
                book.apply_ticker(update.ticker);
                book.snapshot()
            }
            None => {
                tracing::trace!(pair = %update.pair, "ticker for pair without a book ignored");
                return;
            }
        };
        self.publish(snapshot);
    }

    fn desync(&mut self, pair: Pair, error: BookError) -> Vec<Request> {
        tracing::warn!(pair = %pair, error = %error, resync = self.settings.auto_resync, "book desynchronized, discarding");
        self.books.remove(&pair);
        self.tracked.insert(pair.clone(), PairState::Awaiting);
        let _ = self.events.send(BookEvent::Desync {
            pair: pair.clone(),
            error,
        });
        if !self.settings.auto_resync {
            return Vec::new();
        }
        vec![
            Request::Unsubscribe { pair: pair.clone() },
            Request::Subscribe {
                pair,
                depth: self.settings.subscribe_depth,
            },
        ]
    }

    fn remove_book(&mut self, pair: &Pair) {
        if self.books.remove(pair).is_some() {
            let _ = self.events.send(BookEvent::Removed { pair: pair.clone() });
        }
    }

    fn publish(&self, snapshot: BookSnapshot) {
        // No subscribers is not an error.
        let _ = self.published.send(snapshot);
    }
}

fn log_latency(delta: &BookDelta, received_at: Timestamp) {
    let now = Timestamp::now();
    let exchange_us = delta
        .time
        .filter(|ms| *ms > 0)
        .map(|ms| now.micros_since(&Timestamp::from_millis(ms as u64)));
    tracing::debug!(
        pair = %delta.pair,
        id = delta.id,
        exchange_latency_us = ?exchange_us,
        local_latency_us = now.micros_since(&received_at),
        "delta applied"
    );
}
