//! Core types shared by the protocol client and its consumers.

pub mod level;
pub mod market_data;
pub mod pair;
pub mod timestamp;

// Re-export primary types for convenient access via `cx_core::types::*`.
pub use level::{Level, Side, MAX_PRICE};
pub use market_data::{BookSnapshot, Ticker};
pub use pair::{Pair, PairError};
pub use timestamp::Timestamp;
