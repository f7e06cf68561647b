//! # cx-core
//!
//! Shared types, configuration and logging for the cx market-data client.
//!
//! This crate provides the building blocks used by the protocol crate and the
//! driver binary: canonical instrument keys, price levels with their empty-slot
//! sentinels, published book snapshots, wall-clock timestamps, layered
//! configuration and the tracing setup.

pub mod config;
pub mod logging;
pub mod types;
