//! Typed protocol messages.
//!
//! [`Message`] is the inbound sum type the router and the book engine match
//! on; [`Request`] is everything the client sends. Conversion from the raw
//! [`Envelope`] happens once, in the codec.

use serde::Deserialize;

use cx_core::types::{Pair, Ticker, Timestamp};

use super::codec::DecodeError;
use super::types::{
    AuthFields, Envelope, PairField, Payload, TAG_AUTH, TAG_BOOK_SUBSCRIBE, TAG_BOOK_UNSUBSCRIBE,
    TAG_CONNECTED, TAG_DISCONNECTING, TAG_MD_UPDATE, TAG_PING, TAG_PONG, TAG_TICKER,
};

/// Result of the authentication handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthAck {
    pub ok: bool,
    pub error: Option<String>,
}

/// Full book state for one instrument (the subscribe acknowledgment).
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshotMsg {
    pub pair: Pair,
    pub id: i64,
    pub bids: Vec<(f32, f32)>,
    pub asks: Vec<(f32, f32)>,
}

/// Incremental book change. Quantity 0 removes a level.
#[derive(Debug, Clone, PartialEq)]
pub struct BookDelta {
    pub pair: Pair,
    pub id: i64,
    pub bids: Vec<(f32, f32)>,
    pub asks: Vec<(f32, f32)>,
    /// Exchange event time, epoch milliseconds.
    pub time: Option<i64>,
}

/// Ticker scalars for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerUpdate {
    pub pair: Pair,
    pub ticker: Ticker,
}

/// Inbound message, discriminated by type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth(AuthAck),
    /// Liveness ping, kept whole so the pong can echo it.
    Ping(Envelope),
    Pong,
    Connected,
    Disconnecting(Option<String>),
    BookSnapshot(BookSnapshotMsg),
    BookUnsubscribed(Pair),
    BookDelta(BookDelta),
    Ticker(TickerUpdate),
    /// Order-management reply, passed through untouched.
    Order(Envelope),
    /// Reply with `ok: "error"` for any tag.
    Error { tag: String, message: String },
    Unknown(Envelope),
}

impl Message {
    /// Wire tag this message was decoded from.
    pub fn tag(&self) -> &str {
        match self {
            Message::Auth(_) => TAG_AUTH,
            Message::Ping(_) => TAG_PING,
            Message::Pong => TAG_PONG,
            Message::Connected => TAG_CONNECTED,
            Message::Disconnecting(_) => TAG_DISCONNECTING,
            Message::BookSnapshot(_) => TAG_BOOK_SUBSCRIBE,
            Message::BookUnsubscribed(_) => TAG_BOOK_UNSUBSCRIBE,
            Message::BookDelta(_) => TAG_MD_UPDATE,
            Message::Ticker(_) => TAG_TICKER,
            Message::Order(env) | Message::Unknown(env) => &env.e,
            Message::Error { tag, .. } => tag,
        }
    }

    /// Build the typed message from a decoded envelope.
    pub fn from_envelope(env: Envelope) -> Result<Self, DecodeError> {
        if env.e.is_empty() {
            return Err(DecodeError::MissingField {
                tag: String::new(),
                field: "e",
            });
        }

        if env.e == TAG_AUTH {
            let payload = payload_of(&env)?;
            let status = payload.ok.as_deref().or(env.ok.as_deref());
            return Ok(Message::Auth(AuthAck {
                ok: status == Some("ok"),
                error: payload.error,
            }));
        }

        if env.ok.as_deref() == Some("error") {
            let payload = payload_of(&env).unwrap_or_default();
            return Ok(Message::Error {
                tag: env.e,
                message: payload.error.unwrap_or_else(|| "unspecified error".to_string()),
            });
        }

        if env.is_order_management() {
            return Ok(Message::Order(env));
        }

        let tag = env.e.clone();
        let message = match tag.as_str() {
            TAG_PING => Message::Ping(env),
            TAG_PONG => Message::Pong,
            TAG_CONNECTED => Message::Connected,
            TAG_DISCONNECTING => Message::Disconnecting(env.reason),
            TAG_BOOK_SUBSCRIBE => {
                let payload = payload_of(&env)?;
                Message::BookSnapshot(BookSnapshotMsg {
                    pair: pair_of(&env.e, &payload)?,
                    id: id_of(&env.e, &payload)?,
                    bids: payload.bids,
                    asks: payload.asks,
                })
            }
            TAG_BOOK_UNSUBSCRIBE => {
                let payload = payload_of(&env)?;
                Message::BookUnsubscribed(pair_of(&env.e, &payload)?)
            }
            TAG_MD_UPDATE => {
                let payload = payload_of(&env)?;
                Message::BookDelta(BookDelta {
                    pair: pair_of(&env.e, &payload)?,
                    id: id_of(&env.e, &payload)?,
                    time: payload.time,
                    bids: payload.bids,
                    asks: payload.asks,
                })
            }
            TAG_TICKER => {
                let payload = payload_of(&env)?;
                Message::Ticker(TickerUpdate {
                    pair: pair_of(&env.e, &payload)?,
                    ticker: payload.ticker(),
                })
            }
            _ => Message::Unknown(env),
        };
        Ok(message)
    }
}

fn payload_of(env: &Envelope) -> Result<Payload, DecodeError> {
    match &env.data {
        None => Ok(Payload::default()),
        Some(data) => {
            Payload::deserialize(data).map_err(|source| DecodeError::InvalidPayload {
                tag: env.e.clone(),
                source,
            })
        }
    }
}

fn pair_of(tag: &str, payload: &Payload) -> Result<Pair, DecodeError> {
    payload
        .pair
        .as_ref()
        .ok_or_else(|| DecodeError::MissingField {
            tag: tag.to_string(),
            field: "pair",
        })?
        .to_pair()
        .map_err(DecodeError::InvalidPair)
}

fn id_of(tag: &str, payload: &Payload) -> Result<i64, DecodeError> {
    payload.id.ok_or_else(|| DecodeError::MissingField {
        tag: tag.to_string(),
        field: "id",
    })
}

/// A decoded message plus the moment it crossed the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub message: Message,
    /// Receipt time. Used for latency logging only.
    pub received_at: Timestamp,
    /// Session connection the frame arrived on, counted from 1. Zero when
    /// decoded outside a session.
    pub connection: u64,
}

/// Outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Signed handshake.
    Auth(AuthFields),
    /// Answer to a ping: the ping itself with the tag swapped.
    Pong(Envelope),
    /// `order-book-subscribe` with a full snapshot.
    Subscribe { pair: Pair, depth: u32 },
    Unsubscribe { pair: Pair },
    /// One-shot ticker query.
    Ticker { pair: Pair },
}

impl Request {
    pub fn tag(&self) -> &str {
        match self {
            Request::Auth(_) => TAG_AUTH,
            Request::Pong(_) => TAG_PONG,
            Request::Subscribe { .. } => TAG_BOOK_SUBSCRIBE,
            Request::Unsubscribe { .. } => TAG_BOOK_UNSUBSCRIBE,
            Request::Ticker { .. } => TAG_TICKER,
        }
    }

    /// Wire envelope for this request.
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Request::Auth(fields) => Envelope {
                auth: Some(fields.clone()),
                ..Envelope::tagged(TAG_AUTH)
            },
            Request::Pong(ping) => Envelope {
                e: TAG_PONG.to_string(),
                ..ping.clone()
            },
            Request::Subscribe { pair, depth } => Envelope {
                data: Some(serde_json::json!({
                    "pair": PairField::from(pair),
                    "subscribe": true,
                    "depth": depth,
                })),
                ..Envelope::tagged(TAG_BOOK_SUBSCRIBE)
            },
            Request::Unsubscribe { pair } => Envelope {
                data: Some(serde_json::json!({ "pair": PairField::from(pair) })),
                ..Envelope::tagged(TAG_BOOK_UNSUBSCRIBE)
            },
            Request::Ticker { pair } => Envelope {
                data: Some(serde_json::json!(pair.symbols())),
                ..Envelope::tagged(TAG_TICKER)
            },
        }
    }
}
