//! Pipeline stages.
//!
//! Each stage is a task that pulls from one bounded queue and pushes to the
//! next. A full output queue suspends the stage (backpressure); nothing is
//! dropped except frames that fail to decode or encode. Every stage stops on
//! the shared [`CancellationToken`] or when its input queue closes.
//!
//! ```text
//! transport -> reader -> inbound -> router -> book responses -> engine
//!                                         -> book updates   -> engine
//!                                         -> orders         -> consumer
//!                                         -> responses      -> response handler
//! requests -> encoder -> frames -> writer -> transport
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cexio::codec;
use crate::cexio::message::{Inbound, Message, Request};
use crate::keepalive::KeepaliveResponder;
use crate::ws::{FrameSink, FrameSource, TransportError};

/// Encoded frames waiting for a writer. Shared so that the writer of each
/// new connection picks up where the previous one stopped.
pub type SharedFrames = Arc<Mutex<mpsc::Receiver<String>>>;

/// Why the reader returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderExit {
    /// Shutdown was requested.
    Cancelled,
    /// The peer closed the connection.
    Closed,
    /// The transport failed.
    Failed(TransportError),
    /// Nobody consumes decoded messages any more.
    InboundClosed,
}

/// Push `item`, giving up if `cancel` fires first. Returns `false` when the
/// item was not delivered.
pub(crate) async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

/// Reader: transport frames to decoded [`Inbound`] messages.
///
/// Every message is stamped with `connection` so later stages can tell data
/// of a dropped connection from data of its successor. Malformed frames are
/// logged and skipped. Returns when the connection ends so the caller can
/// decide whether to reconnect.
pub async fn run_reader<S: FrameSource>(
    mut source: S,
    inbound: mpsc::Sender<Inbound>,
    connection: u64,
    cancel: CancellationToken,
) -> ReaderExit {
    tracing::info!(stage = "reader", connection, "stage started");
    let exit = loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break ReaderExit::Cancelled,
            r = source.receive() => r,
        };
        match received {
            Ok(Some(frame)) => {
                tracing::trace!(frame = %frame, "RECV");
                match codec::decode(&frame) {
                    Ok(mut message) => {
                        message.connection = connection;
                        if !forward(&inbound, message, &cancel).await {
                            break if cancel.is_cancelled() {
                                ReaderExit::Cancelled
                            } else {
                                ReaderExit::InboundClosed
                            };
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, frame_len = frame.len(), "dropping undecodable frame");
                    }
                }
            }
            Ok(None) => break ReaderExit::Closed,
            Err(e) => {
                tracing::error!(error = %e, "transport read failed");
                break ReaderExit::Failed(e);
            }
        }
    };
    tracing::info!(stage = "reader", exit = ?exit, "stage stopped");
    exit
}

/// Encoder: structured requests to wire text.
pub async fn run_encoder(
    mut requests: mpsc::Receiver<Request>,
    frames: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    tracing::info!(stage = "encoder", "stage started");
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = requests.recv() => match r {
                Some(r) => r,
                None => break,
            },
        };
        match codec::encode(&request) {
            Ok(text) => {
                tracing::trace!(tag = request.tag(), "request encoded");
                if !forward(&frames, text, &cancel).await {
                    break;
                }
            }
            Err(e) => tracing::error!(error = %e, "dropping unencodable request"),
        }
    }
    tracing::info!(stage = "encoder", "stage stopped");
}

/// Writer: wire text to the transport. Failed writes are logged and the
/// frame is dropped.
pub async fn run_writer<K: FrameSink>(mut sink: K, frames: SharedFrames, cancel: CancellationToken) {
    let mut frames = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        guard = frames.lock() => guard,
    };
    tracing::info!(stage = "writer", "stage started");
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            f = frames.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };
        // Frame content may carry a signature, log the size only.
        tracing::trace!(frame_len = frame.len(), "SEND");
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = sink.send(frame) => r,
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "write failed, frame dropped");
        }
    }
    tracing::info!(stage = "writer", "stage stopped");
}

/// Router destinations.
#[derive(Debug, Clone)]
pub struct Routes {
    /// Snapshots and unsubscribe acks.
    pub book_responses: mpsc::Sender<Inbound>,
    /// Deltas and tickers.
    pub book_updates: mpsc::Sender<Inbound>,
    /// Order-management replies.
    pub orders: mpsc::Sender<Inbound>,
    /// Everything else.
    pub responses: mpsc::Sender<Inbound>,
}

/// Queue a message belongs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    BookResponse,
    BookUpdate,
    Order,
    Response,
}

impl Route {
    pub fn of(message: &Message) -> Self {
        match message {
            Message::BookSnapshot(_) | Message::BookUnsubscribed(_) => Route::BookResponse,
            Message::BookDelta(_) | Message::Ticker(_) => Route::BookUpdate,
            Message::Order(_) => Route::Order,
            Message::Auth(_)
            | Message::Ping(_)
            | Message::Pong
            | Message::Connected
            | Message::Disconnecting(_)
            | Message::Error { .. }
            | Message::Unknown(_) => Route::Response,
        }
    }
}

/// Router: classifies inbound messages by tag.
///
/// A dropped order-management consumer is tolerated (its messages are
/// discarded); any other closed destination stops the router.
pub async fn run_router(
    mut inbound: mpsc::Receiver<Inbound>,
    routes: Routes,
    cancel: CancellationToken,
) {
    tracing::info!(stage = "router", "stage started");
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            m = inbound.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        let route = Route::of(&message.message);
        let target = match route {
            Route::BookResponse => &routes.book_responses,
            Route::BookUpdate => &routes.book_updates,
            Route::Order => &routes.orders,
            Route::Response => &routes.responses,
        };
        if !forward(target, message, &cancel).await {
            if cancel.is_cancelled() {
                break;
            }
            if route == Route::Order {
                tracing::debug!("no order-management consumer, reply discarded");
                continue;
            }
            tracing::warn!(route = ?route, "destination queue closed");
            break;
        }
    }
    tracing::info!(stage = "router", "stage stopped");
}

/// Generic response handler: answers pings and reports auth results.
pub async fn run_response_handler(
    mut responses: mpsc::Receiver<Inbound>,
    keepalive: KeepaliveResponder,
    cancel: CancellationToken,
) {
    tracing::info!(stage = "responses", "stage started");
    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            m = responses.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };
        match inbound.message {
            Message::Ping(ping) => {
                if !keepalive.respond(ping, &cancel).await {
                    break;
                }
            }
            Message::Auth(ack) if ack.ok => tracing::info!("authenticated"),
            Message::Auth(ack) => {
                tracing::error!(error = ack.error.as_deref().unwrap_or("unknown"), "authentication failed");
            }
            Message::Error { tag, message } => {
                tracing::error!(tag = %tag, error = %message, "exchange returned an error");
            }
            Message::Connected => tracing::info!("exchange greeted connection"),
            Message::Disconnecting(reason) => {
                tracing::warn!(reason = reason.as_deref().unwrap_or(""), "exchange is disconnecting");
            }
            Message::Pong => tracing::trace!("pong"),
            other => tracing::debug!(tag = other.tag(), "unhandled response"),
        }
    }
    tracing::info!(stage = "responses", "stage stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cexio::message::{AuthAck, BookDelta};
    use crate::cexio::types::Envelope;
    use crate::memory::memory_transport;
    use cx_core::types::{Pair, Timestamp};
    use std::time::Duration;
    use tokio::time::timeout;

    fn inbound(message: Message) -> Inbound {
        Inbound {
            message,
            received_at: Timestamp(0),
            connection: 0,
        }
    }

    fn delta(id: i64) -> Message {
        Message::BookDelta(BookDelta {
            pair: Pair::parse("BTC:USD").unwrap(),
            id,
            bids: vec![],
            asks: vec![],
            time: None,
        })
    }

    #[test]
    fn test_route_classification() {
        let pair = Pair::parse("BTC:USD").unwrap();
        assert_eq!(Route::of(&Message::BookUnsubscribed(pair)), Route::BookResponse);
        assert_eq!(Route::of(&delta(1)), Route::BookUpdate);
        assert_eq!(Route::of(&Message::Order(Envelope::tagged("tx"))), Route::Order);
        assert_eq!(Route::of(&Message::Ping(Envelope::tagged("ping"))), Route::Response);
        assert_eq!(
            Route::of(&Message::Auth(AuthAck { ok: true, error: None })),
            Route::Response
        );
        assert_eq!(Route::of(&Message::Unknown(Envelope::tagged("x"))), Route::Response);
    }

    #[tokio::test]
    async fn test_reader_skips_malformed_and_reports_close() {
        let (source, _sink, peer) = memory_transport();
        let (tx, mut rx) = mpsc::channel(16);
        peer.push("{garbage");
        peer.push(r#"{"e":"pong"}"#);
        peer.close();

        let exit = run_reader(source, tx, 1, CancellationToken::new()).await;
        assert_eq!(exit, ReaderExit::Closed);
        assert_eq!(rx.recv().await.unwrap().message, Message::Pong);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reader_stamps_connection() {
        let (source, _sink, peer) = memory_transport();
        let (tx, mut rx) = mpsc::channel(16);
        peer.push(r#"{"e":"pong"}"#);
        peer.close();

        run_reader(source, tx, 3, CancellationToken::new()).await;
        assert_eq!(rx.recv().await.unwrap().connection, 3);
    }

    #[tokio::test]
    async fn test_reader_reports_transport_failure() {
        let (source, _sink, peer) = memory_transport();
        let (tx, _rx) = mpsc::channel(16);
        peer.fail("reset by peer");

        let exit = run_reader(source, tx, 1, CancellationToken::new()).await;
        assert_eq!(
            exit,
            ReaderExit::Failed(TransportError::Read("reset by peer".into()))
        );
    }

    #[tokio::test]
    async fn test_reader_stops_on_cancel_while_blocked() {
        let (source, _sink, peer) = memory_transport();
        let (tx, _rx) = mpsc::channel(1);
        // Two frames into a queue of one: the second send blocks.
        peer.push(r#"{"e":"pong"}"#);
        peer.push(r#"{"e":"pong"}"#);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_reader(source, tx, 1, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), ReaderExit::Cancelled);
    }

    #[tokio::test]
    async fn test_encoder_and_writer_deliver_in_order() {
        let (_source, sink, mut peer) = memory_transport();
        let (req_tx, req_rx) = mpsc::channel(16);
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let frames: SharedFrames = Arc::new(Mutex::new(frame_rx));
        let cancel = CancellationToken::new();

        tokio::spawn(run_encoder(req_rx, frame_tx, cancel.clone()));
        tokio::spawn(run_writer(sink, frames, cancel.clone()));

        let pair = Pair::parse("BTC:USD").unwrap();
        req_tx.send(Request::Ticker { pair: pair.clone() }).await.unwrap();
        req_tx.send(Request::Unsubscribe { pair }).await.unwrap();

        assert_eq!(peer.recv().await.unwrap(), r#"{"e":"ticker","data":["BTC","USD"]}"#);
        assert!(peer.recv().await.unwrap().starts_with(r#"{"e":"order-book-unsubscribe""#));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_writer_survives_failed_writes() {
        let (_source, sink, peer) = memory_transport();
        // Every write fails from here on.
        drop(peer);
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let frames: SharedFrames = Arc::new(Mutex::new(frame_rx));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_writer(sink, frames, cancel.clone()));

        // A queue of one only accepts the later frames if the writer keeps
        // pulling after each failure.
        for i in 0..5 {
            timeout(Duration::from_secs(1), frame_tx.send(format!("frame {i}")))
                .await
                .expect("writer stopped pulling frames")
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_router_splits_queues() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (resp_tx, mut resp_rx) = mpsc::channel(16);
        let (upd_tx, mut upd_rx) = mpsc::channel(16);
        let (ord_tx, mut ord_rx) = mpsc::channel(16);
        let (gen_tx, mut gen_rx) = mpsc::channel(16);
        let routes = Routes {
            book_responses: resp_tx,
            book_updates: upd_tx,
            orders: ord_tx,
            responses: gen_tx,
        };
        let cancel = CancellationToken::new();
        tokio::spawn(run_router(in_rx, routes, cancel.clone()));

        let pair = Pair::parse("BTC:USD").unwrap();
        in_tx.send(inbound(Message::BookUnsubscribed(pair))).await.unwrap();
        in_tx.send(inbound(delta(7))).await.unwrap();
        in_tx.send(inbound(Message::Order(Envelope::tagged("tx")))).await.unwrap();
        in_tx.send(inbound(Message::Pong)).await.unwrap();

        assert!(matches!(resp_rx.recv().await.unwrap().message, Message::BookUnsubscribed(_)));
        assert_eq!(upd_rx.recv().await.unwrap().message, delta(7));
        assert!(matches!(ord_rx.recv().await.unwrap().message, Message::Order(_)));
        assert_eq!(gen_rx.recv().await.unwrap().message, Message::Pong);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_router_tolerates_missing_order_consumer() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (resp_tx, _resp_rx) = mpsc::channel(16);
        let (upd_tx, mut upd_rx) = mpsc::channel(16);
        let (ord_tx, ord_rx) = mpsc::channel(16);
        let (gen_tx, _gen_rx) = mpsc::channel(16);
        drop(ord_rx);
        let routes = Routes {
            book_responses: resp_tx,
            book_updates: upd_tx,
            orders: ord_tx,
            responses: gen_tx,
        };
        tokio::spawn(run_router(in_rx, routes, CancellationToken::new()));

        in_tx.send(inbound(Message::Order(Envelope::tagged("tx")))).await.unwrap();
        in_tx.send(inbound(delta(3))).await.unwrap();
        assert_eq!(upd_rx.recv().await.unwrap().message, delta(3));
    }

    #[tokio::test]
    async fn test_response_handler_answers_ping() {
        let (resp_tx, resp_rx) = mpsc::channel(16);
        let (req_tx, mut req_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_response_handler(
            resp_rx,
            KeepaliveResponder::new(req_tx),
            cancel.clone(),
        ));

        let ping = Envelope {
            time: Some(5),
            ..Envelope::tagged("ping")
        };
        resp_tx
            .send(inbound(Message::Auth(AuthAck { ok: false, error: Some("bad".into()) })))
            .await
            .unwrap();
        resp_tx.send(inbound(Message::Ping(ping.clone()))).await.unwrap();

        assert_eq!(req_rx.recv().await.unwrap(), Request::Pong(ping));
        cancel.cancel();
    }
}
