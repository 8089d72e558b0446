//! Manager factory: builds snapshot schedulers from config.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bookfeed_core::config::{ExchangeConfig, MarketConfig, SnapshotSettings};
use bookfeed_core::error::BookfeedError;
use bookfeed_core::metrics::MetricsRegistry;
use bookfeed_core::types::{Exchange, MarketType};

use crate::publish::SnapshotPublisher;
use crate::rest::{RestFetcher, RestVenue};
use crate::scheduler::{SchedulerConfig, SnapshotScheduler};
use crate::ws_api::{WsApiFetcher, WsApiVenue};
use crate::{FetchError, RawBook, SnapshotFetcher};

/// Transport variant chosen for a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Venue {
    Rest(RestVenue),
    WsApi(WsApiVenue),
}

/// Map `(exchange, market_type)` to its venue. Unsupported pairs are a
/// configuration error.
pub fn resolve_venue(exchange: Exchange, market_type: MarketType) -> Result<Venue, BookfeedError> {
    use Exchange::*;
    use MarketType::*;
    Ok(match (exchange, market_type) {
        (Binance, Spot) => Venue::Rest(RestVenue::BinanceSpot),
        (Binance, Futures) => Venue::WsApi(WsApiVenue::BinanceFutures),
        (Okx, Spot) => Venue::Rest(RestVenue::OkxSpot),
        (Bybit, Spot) => Venue::Rest(RestVenue::BybitSpot),
        (Bybit, Futures) => Venue::Rest(RestVenue::BybitLinear),
        (Deribit, Futures) => Venue::WsApi(WsApiVenue::DeribitFutures),
        (Deribit, Options) => Venue::WsApi(WsApiVenue::DeribitOptions),
        (e, m) => {
            return Err(BookfeedError::Config(format!("no snapshot source for {e}/{m}")));
        }
    })
}

/// Closed set of fetchers behind the [`SnapshotFetcher`] interface.
pub enum Fetcher {
    Rest(RestFetcher),
    WsApi(WsApiFetcher),
}

#[async_trait]
impl SnapshotFetcher for Fetcher {
    fn exchange(&self) -> Exchange {
        match self {
            Fetcher::Rest(f) => f.exchange(),
            Fetcher::WsApi(f) => f.exchange(),
        }
    }

    fn market_type(&self) -> MarketType {
        match self {
            Fetcher::Rest(f) => f.market_type(),
            Fetcher::WsApi(f) => f.market_type(),
        }
    }

    async fn start(&self, metrics: Arc<MetricsRegistry>) {
        match self {
            Fetcher::Rest(f) => f.start(metrics).await,
            Fetcher::WsApi(f) => f.start(metrics).await,
        }
    }

    async fn fetch_one(&self, symbol: &str, depth: u32, timeout: Duration) -> Result<RawBook, FetchError> {
        match self {
            Fetcher::Rest(f) => f.fetch_one(symbol, depth, timeout).await,
            Fetcher::WsApi(f) => f.fetch_one(symbol, depth, timeout).await,
        }
    }

    async fn stop(&self) {
        match self {
            Fetcher::Rest(f) => f.stop().await,
            Fetcher::WsApi(f) => f.stop().await,
        }
    }
}

/// Create the fetcher for one configured market.
pub fn create_fetcher(exchange: Exchange, market: &MarketConfig) -> Result<Fetcher> {
    let venue = resolve_venue(exchange, market.market_type)?;
    Ok(match venue {
        Venue::Rest(v) => Fetcher::Rest(RestFetcher::new(v, market.rest_url.clone())?),
        Venue::WsApi(v) => Fetcher::WsApi(WsApiFetcher::new(v, market.ws_url.clone(), market.reconnect.policy())?),
    })
}

/// Create one scheduler per market of an exchange.
pub fn create_schedulers(
    exchange: &ExchangeConfig,
    snapshot: &SnapshotSettings,
    publisher: Arc<dyn SnapshotPublisher>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Vec<SnapshotScheduler>> {
    let kind = exchange.exchange_kind()?;
    if exchange.markets.is_empty() {
        bail!("exchange {kind} has no markets configured");
    }

    exchange
        .markets
        .iter()
        .map(|market| {
            let fetcher = create_fetcher(kind, market).with_context(|| format!("{kind}/{}", market.market_type))?;
            let config = SchedulerConfig {
                symbols: market.symbols.clone(),
                interval: snapshot.interval(),
                request_timeout: market.request_timeout(snapshot),
                depth: market.effective_depth(snapshot),
            };
            Ok(SnapshotScheduler::new(config, Arc::new(fetcher), Arc::clone(&publisher), Arc::clone(&metrics)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::LogPublisher;
    use bookfeed_core::config::AppConfig;

    #[test]
    fn supported_pairs() {
        assert_eq!(resolve_venue(Exchange::Binance, MarketType::Spot).unwrap(), Venue::Rest(RestVenue::BinanceSpot));
        assert_eq!(
            resolve_venue(Exchange::Deribit, MarketType::Options).unwrap(),
            Venue::WsApi(WsApiVenue::DeribitOptions)
        );
        assert!(resolve_venue(Exchange::Okx, MarketType::Options).is_err());
        assert!(resolve_venue(Exchange::Deribit, MarketType::Spot).is_err());
    }

    #[tokio::test]
    async fn schedulers_follow_config() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{
                "snapshot": {"interval_secs": 1.0, "depth": 50},
                "exchanges": [{
                    "exchange": "binance",
                    "markets": [
                        {"market_type": "spot", "symbols": ["BTCUSDT", "ETHUSDT"]},
                        {"market_type": "futures", "symbols": ["BTCUSDT"], "depth": 20}
                    ]
                }]
            }"#,
        )
        .unwrap();
        let scheds = create_schedulers(
            &cfg.exchanges[0],
            &cfg.snapshot,
            Arc::new(LogPublisher),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let labels: Vec<&str> = scheds.iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["binance/spot", "binance/futures"]);
        assert_eq!(scheds[0].sync_states().len(), 2);
    }

    #[test]
    fn unsupported_market_is_rejected() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"exchanges": [{"exchange": "okx", "markets": [{"market_type": "options", "symbols": ["X"]}]}]}"#,
        )
        .unwrap();
        let r = create_schedulers(&cfg.exchanges[0], &cfg.snapshot, Arc::new(LogPublisher), Arc::new(MetricsRegistry::new()));
        assert!(r.is_err());
    }
}
