//! WebSocket request/response fetcher.
//!
//! Exactly one [`WsRequestSession`] per `(exchange, market)`; every fetch
//! sends one uniquely-id'd request over it and waits for the matching
//! response. Reconnects are driven by the session on its own backoff
//! schedule and never touch the tick cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookfeed_core::metrics::{MetricsRegistry, names};
use bookfeed_core::types::{Exchange, MarketType};
use bookfeed_core::ws::{ReconnectPolicy, WsRequestSession, WsSessionConfig};
use serde_json::Value;

use crate::{FetchError, RawBook, SnapshotFetcher, binance, deribit};

/// The WebSocket API snapshot endpoints this crate knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsApiVenue {
    BinanceFutures,
    DeribitFutures,
    DeribitOptions,
}

impl WsApiVenue {
    pub fn exchange(&self) -> Exchange {
        match self {
            Self::BinanceFutures => Exchange::Binance,
            Self::DeribitFutures | Self::DeribitOptions => Exchange::Deribit,
        }
    }

    pub fn market_type(&self) -> MarketType {
        match self {
            Self::BinanceFutures | Self::DeribitFutures => MarketType::Futures,
            Self::DeribitOptions => MarketType::Options,
        }
    }

    pub fn default_url(&self) -> &'static str {
        match self {
            Self::BinanceFutures => binance::FUTURES_WS_API_URL,
            Self::DeribitFutures | Self::DeribitOptions => deribit::WS_API_URL,
        }
    }

    /// Client ping cadence. Binance pings the client itself.
    pub fn ping_interval(&self) -> Option<Duration> {
        match self {
            Self::BinanceFutures => None,
            Self::DeribitFutures | Self::DeribitOptions => Some(Duration::from_secs(15)),
        }
    }

    pub fn request_frame(&self, id: u64, symbol: &str, depth: u32) -> String {
        match self {
            Self::BinanceFutures => binance::futures_depth_request(id, symbol, depth),
            Self::DeribitFutures | Self::DeribitOptions => deribit::order_book_request(id, symbol, depth),
        }
    }

    pub fn parse_response(&self, frame: &Value) -> Result<RawBook, FetchError> {
        match self {
            Self::BinanceFutures => binance::json_parser::parse_ws_api_response(frame),
            Self::DeribitFutures | Self::DeribitOptions => deribit::json_parser::parse_response(frame),
        }
    }
}

pub struct WsApiFetcher {
    venue: WsApiVenue,
    session: WsRequestSession,
}

impl WsApiFetcher {
    pub fn new(venue: WsApiVenue, url: Option<String>, reconnect: ReconnectPolicy) -> Result<Self, FetchError> {
        let config = WsSessionConfig {
            url: url.unwrap_or_else(|| venue.default_url().to_string()),
            label: format!("{}/{}", venue.exchange(), venue.market_type()),
            reconnect,
            ping_interval: venue.ping_interval(),
        };
        let session = WsRequestSession::new(config).map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { venue, session })
    }

    pub fn venue(&self) -> WsApiVenue {
        self.venue
    }

    pub fn session(&self) -> &WsRequestSession {
        &self.session
    }
}

#[async_trait]
impl SnapshotFetcher for WsApiFetcher {
    fn exchange(&self) -> Exchange {
        self.venue.exchange()
    }

    fn market_type(&self) -> MarketType {
        self.venue.market_type()
    }

    async fn start(&self, metrics: Arc<MetricsRegistry>) {
        let exchange = self.exchange();
        let market_type = self.market_type();
        self.session.start(Some(Arc::new(move |_n| {
            metrics.inc_counter(
                names::SNAPSHOT_RECONNECTIONS_TOTAL,
                &[("exchange", exchange.as_str()), ("market_type", market_type.as_str())],
            );
        })));
    }

    async fn fetch_one(&self, symbol: &str, depth: u32, timeout: Duration) -> Result<RawBook, FetchError> {
        let id = self.session.next_id();
        let frame = self.venue.request_frame(id, symbol, depth);
        let response = self.session.request(id, frame, timeout).await?;
        self.venue.parse_response(&response)
    }

    async fn stop(&self) {
        self.session.stop().await;
    }
}
