//! Normalize raw books into snapshots and hand them downstream.

use std::sync::Arc;

use async_trait::async_trait;
use bookfeed_core::metrics::{MetricsRegistry, names};
use bookfeed_core::time_util;
use bookfeed_core::types::{Exchange, MarketType, OrderBookSnapshot, PriceLevel};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{FetchError, RawBook};

/// Downstream consumer of normalized books (the message bus, in production).
///
/// May be called for a symbol while a previous publish for the same symbol is
/// still running; implementations must tolerate that.
#[async_trait]
pub trait SnapshotPublisher: Send + Sync + 'static {
    async fn publish_enhanced_orderbook(&self, snapshot: Arc<OrderBookSnapshot>) -> anyhow::Result<()>;
}

/// Publisher that only logs a one-line summary per snapshot.
pub struct LogPublisher;

#[async_trait]
impl SnapshotPublisher for LogPublisher {
    async fn publish_enhanced_orderbook(&self, snapshot: Arc<OrderBookSnapshot>) -> anyhow::Result<()> {
        debug!("[publish] {snapshot}");
        Ok(())
    }
}

/// Publisher that forwards snapshots into an unbounded channel.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Arc<OrderBookSnapshot>>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<OrderBookSnapshot>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SnapshotPublisher for ChannelPublisher {
    async fn publish_enhanced_orderbook(&self, snapshot: Arc<OrderBookSnapshot>) -> anyhow::Result<()> {
        self.tx
            .send(snapshot)
            .map_err(|_| anyhow::anyhow!("snapshot receiver dropped"))
    }
}

/// Sort, clean and truncate one side.
///
/// Zero-quantity levels are dropped, the first occurrence of a price wins,
/// and at most `depth` levels are kept.
fn normalize_side(mut levels: Vec<PriceLevel>, descending: bool, depth: usize) -> Vec<PriceLevel> {
    levels.retain(|l| !l.is_removal());
    // Stable sort keeps the exchange's order among equal prices.
    if descending {
        levels.sort_by(|a, b| b.price.cmp(&a.price));
    } else {
        levels.sort_by(|a, b| a.price.cmp(&b.price));
    }
    levels.dedup_by(|later, earlier| later.price == earlier.price);
    levels.truncate(depth);
    levels
}

/// Build a strictly ordered, depth-limited snapshot from a raw book.
pub fn build_snapshot(
    exchange: Exchange,
    market_type: MarketType,
    symbol: &str,
    raw: RawBook,
    depth: u32,
    observed_at_us: u64,
) -> OrderBookSnapshot {
    let depth = depth.max(1) as usize;
    OrderBookSnapshot {
        exchange,
        market_type,
        symbol: symbol.to_string(),
        sequence_id: raw.sequence_id,
        bids: normalize_side(raw.bids, true, depth),
        asks: normalize_side(raw.asks, false, depth),
        exchange_timestamp_ms: raw.exchange_timestamp_ms,
        observed_at_us,
    }
}

/// Normalize, publish, and on success bump the per-symbol update metrics.
pub async fn normalize_and_publish(
    publisher: &dyn SnapshotPublisher,
    metrics: &MetricsRegistry,
    exchange: Exchange,
    market_type: MarketType,
    symbol: &str,
    raw: RawBook,
    depth: u32,
) -> Result<Arc<OrderBookSnapshot>, FetchError> {
    let snapshot = Arc::new(build_snapshot(exchange, market_type, symbol, raw, depth, time_util::now_us()));

    publisher
        .publish_enhanced_orderbook(Arc::clone(&snapshot))
        .await
        .map_err(|e| FetchError::Publish(e.to_string()))?;

    let labels = [("exchange", exchange.as_str()), ("symbol", symbol)];
    metrics.inc_counter(names::ORDERBOOK_UPDATES_TOTAL, &labels);
    metrics.set_gauge(names::LAST_ORDERBOOK_UPDATE_TIMESTAMP, &labels, time_util::now_secs_f64());
    Ok(snapshot)
}
