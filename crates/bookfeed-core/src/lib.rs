//! # bookfeed-core
//!
//! Shared foundation for the order-book snapshot daemon:
//!
//! - **Types** (`types`): exchange/market enums, price levels, order-book snapshots, per-symbol sync state
//! - **Configuration** (`config`): JSON config deserialization, defaults and validation
//! - **Error types** (`error`): domain-specific `BookfeedError` via thiserror
//! - **Control channel** (`control`): supervisor ⇄ worker message envelope and line transport
//! - **Metrics** (`metrics`): labelled counters, gauges and histograms
//! - **WebSocket** (`ws`): request/response session with auto-reconnect
//! - **Time utilities** (`time_util`): wall-clock timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
