//! # cx-market-data
//!
//! Streaming client for the CEX.IO WebSocket push protocol. Maintains a
//! fixed-depth order book per subscribed pair from a snapshot followed by
//! sequenced deltas, and publishes a copy of every change.
//!
//! The client is a pipeline of tasks joined by bounded queues (see
//! [`pipeline`]); [`session::MarketDataClient`] wires it up and keeps the
//! connection alive.

pub mod cexio;
pub mod engine;
pub mod keepalive;
pub mod memory;
pub mod orderbook;
pub mod pipeline;
pub mod relay;
pub mod session;
pub mod ws;

pub use engine::{BookEvent, BookHandle};
pub use orderbook::{BookError, OrderBook};
pub use session::{MarketDataClient, SessionError, SessionHandles, SessionSettings};
