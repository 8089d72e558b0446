//! # bookfeed-md
//!
//! Order-book snapshot synchronization for multiple cryptocurrency exchanges.
//!
//! ## Architecture
//!
//! One [`scheduler::SnapshotScheduler`] runs per `(exchange, market_type)`.
//! Every tick it launches one fetch per symbol through a [`SnapshotFetcher`],
//! normalizes the raw book and hands it to a [`publish::SnapshotPublisher`].
//! The [`registry`] maps a configured market to the right fetcher variant:
//!
//! - [`rest`]: one HTTP GET per symbol per tick (spot markets)
//! - [`ws_api`]: requests multiplexed over one shared WebSocket
//!
//! Exchange specifics (endpoints, depth limits, payload layout) live in
//! [`binance`], [`okx`], [`bybit`] and [`deribit`]. The [`worker`] module is
//! the worker-process side of the supervisor control channel.

pub mod binance;
pub mod bybit;
pub mod deribit;
pub mod json_util;
pub mod okx;
pub mod publish;
pub mod registry;
pub mod rest;
pub mod scheduler;
pub mod worker;
pub mod ws_api;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookfeed_core::metrics::MetricsRegistry;
use bookfeed_core::types::{Exchange, FetchStatus, MarketType, PriceLevel};
use bookfeed_core::ws::RequestError;
use thiserror::Error;

/// Why a single symbol fetch failed. Every variant is transient-per-tick:
/// the scheduler logs it and the next tick tries again.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    Disconnected,

    /// The exchange answered with an error payload.
    #[error("rejected by exchange: {0}")]
    Rejected(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

impl FetchError {
    pub fn status(&self) -> FetchStatus {
        match self {
            FetchError::Timeout(_) => FetchStatus::Timeout,
            _ => FetchStatus::Error,
        }
    }
}

impl From<RequestError> for FetchError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Timeout(d) => FetchError::Timeout(d),
            RequestError::Disconnected | RequestError::Closed => FetchError::Disconnected,
        }
    }
}

/// One symbol's book as returned by the exchange, before normalization.
/// Levels may be unsorted and may contain zero quantities or duplicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub sequence_id: Option<u64>,
    pub exchange_timestamp_ms: Option<u64>,
}

/// Exchange-agnostic hook driven by the snapshot scheduler.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    fn market_type(&self) -> MarketType;

    /// Bring up shared resources (e.g. the WebSocket session).
    async fn start(&self, _metrics: Arc<MetricsRegistry>) {}

    /// Fetch one symbol's book at `depth` levels, giving up after `timeout`.
    async fn fetch_one(&self, symbol: &str, depth: u32, timeout: Duration) -> Result<RawBook, FetchError>;

    /// Release shared resources.
    async fn stop(&self) {}
}
