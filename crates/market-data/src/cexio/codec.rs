//! Frame codec: structured requests to wire text, wire text to typed messages.

use cx_core::types::{PairError, Timestamp};

use super::message::{Inbound, Message, Request};
use super::types::Envelope;

/// Inbound frame could not be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{tag:?} frame missing field {field:?}")]
    MissingField { tag: String, field: &'static str },
    #[error("invalid {tag:?} payload: {source}")]
    InvalidPayload {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    InvalidPair(#[from] PairError),
}

/// Outbound request could not be serialized.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode {tag:?} request: {source}")]
pub struct EncodeError {
    pub tag: String,
    #[source]
    pub source: serde_json::Error,
}

/// Serialize a request to its wire text.
pub fn encode(request: &Request) -> Result<String, EncodeError> {
    serde_json::to_string(&request.to_envelope()).map_err(|source| EncodeError {
        tag: request.tag().to_string(),
        source,
    })
}

/// Decode one frame, stamping the current time as its receipt time.
pub fn decode(frame: &str) -> Result<Inbound, DecodeError> {
    decode_at(frame, Timestamp::now())
}

/// Decode one frame with an explicit receipt time.
pub fn decode_at(frame: &str, received_at: Timestamp) -> Result<Inbound, DecodeError> {
    let envelope: Envelope = serde_json::from_str(frame)?;
    Ok(Inbound {
        message: Message::from_envelope(envelope)?,
        received_at,
        connection: 0,
    })
}
