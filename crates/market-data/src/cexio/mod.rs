//! CEX.IO WebSocket protocol: wire types, typed messages, frame codec and
//! handshake signing.

pub mod auth;
pub mod codec;
pub mod message;
pub mod types;

pub use auth::Authenticator;
pub use codec::{decode, encode, DecodeError, EncodeError};
pub use message::{AuthAck, BookDelta, BookSnapshotMsg, Inbound, Message, Request, TickerUpdate};
pub use types::{AuthFields, Envelope, PairField, Payload};
