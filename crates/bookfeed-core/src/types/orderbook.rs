//! Order-book entities, the vocabulary shared by every snapshot fetcher.
//!
//! # Timestamp convention
//!
//! Local timestamps are in **microseconds since Unix epoch** (us). Exchange
//! timestamps are kept in the exchange's own unit (milliseconds) and are
//! optional because not every snapshot endpoint returns one.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{Exchange, FetchStatus, MarketType};

// ---------------------------------------------------------------------------
// PriceLevel
// ---------------------------------------------------------------------------

/// One price level of an order book side.
///
/// A quantity of zero in an incremental update means "remove this level".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    #[inline]
    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

// ---------------------------------------------------------------------------
// OrderBookSnapshot
// ---------------------------------------------------------------------------

/// A full point-in-time view of one symbol's book, depth-limited.
///
/// - `bids` are sorted **strictly descending** by price (best bid first).
/// - `asks` are sorted **strictly ascending** by price (best ask first).
///
/// Every successful fetch produces a fresh snapshot; it is never mutated
/// after being handed to the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    /// Exchange-provided sequence / update id, when the endpoint has one.
    pub sequence_id: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Exchange timestamp in milliseconds, when provided.
    pub exchange_timestamp_ms: Option<u64>,
    /// Local receive time in microseconds.
    pub observed_at_us: u64,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// `best_ask - best_bid`, if both sides are present.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Returns `true` if bids are strictly descending and asks strictly
    /// ascending by price.
    pub fn is_well_ordered(&self) -> bool {
        self.bids.windows(2).all(|w| w[0].price > w[1].price)
            && self.asks.windows(2).all(|w| w[0].price < w[1].price)
    }
}

impl std::fmt::Display for OrderBookSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bid = self.best_bid().map(|l| l.price.to_string()).unwrap_or_else(|| "-".into());
        let ask = self.best_ask().map(|l| l.price.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "Book({}/{} {} bid={bid} ask={ask} levels={}x{} seq={:?})",
            self.exchange,
            self.market_type,
            self.symbol,
            self.bids.len(),
            self.asks.len(),
            self.sequence_id
        )
    }
}

// ---------------------------------------------------------------------------
// SymbolSyncState
// ---------------------------------------------------------------------------

/// Per-symbol synchronization bookkeeping kept by a snapshot scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSyncState {
    pub symbol: String,
    pub last_sequence_id: Option<u64>,
    /// Local time (us) of the last successful publish.
    pub last_success_us: Option<u64>,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub cancelled: u64,
    /// Ticks where this symbol was skipped because a fetch was still in flight.
    pub skipped_ticks: u64,
}

impl SymbolSyncState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), ..Default::default() }
    }

    /// Record the outcome of one fetch.
    pub fn record(&mut self, status: FetchStatus, sequence_id: Option<u64>, now_us: u64) {
        match status {
            FetchStatus::Success => {
                self.successes += 1;
                self.consecutive_failures = 0;
                self.last_success_us = Some(now_us);
                if sequence_id.is_some() {
                    self.last_sequence_id = sequence_id;
                }
            }
            FetchStatus::Timeout => {
                self.timeouts += 1;
                self.consecutive_failures += 1;
            }
            FetchStatus::Error => {
                self.errors += 1;
                self.consecutive_failures += 1;
            }
            // Cancellation is a shutdown artefact, not an exchange failure.
            FetchStatus::Cancelled => self.cancelled += 1,
        }
    }
}
