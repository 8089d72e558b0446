//! REST polling fetcher: one HTTP GET per symbol per tick.
//!
//! Non-200 responses and timeouts fail the fetch; there is no retry and no
//! backoff, the next tick simply asks again.

use std::time::Duration;

use async_trait::async_trait;
use bookfeed_core::types::{Exchange, MarketType};
use serde_json::Value;
use tracing::debug;

use crate::{FetchError, RawBook, SnapshotFetcher, binance, bybit, okx};

/// Path and query of one snapshot request, relative to the venue base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestRequest {
    pub path: &'static str,
    pub query: Vec<(&'static str, String)>,
}

/// The REST snapshot endpoints this crate knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestVenue {
    BinanceSpot,
    OkxSpot,
    BybitSpot,
    BybitLinear,
}

impl RestVenue {
    pub fn exchange(&self) -> Exchange {
        match self {
            Self::BinanceSpot => Exchange::Binance,
            Self::OkxSpot => Exchange::Okx,
            Self::BybitSpot | Self::BybitLinear => Exchange::Bybit,
        }
    }

    pub fn market_type(&self) -> MarketType {
        match self {
            Self::BybitLinear => MarketType::Futures,
            _ => MarketType::Spot,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::BinanceSpot => binance::SPOT_REST_URL,
            Self::OkxSpot => okx::REST_URL,
            Self::BybitSpot | Self::BybitLinear => bybit::REST_URL,
        }
    }

    pub fn request(&self, symbol: &str, depth: u32) -> RestRequest {
        match self {
            Self::BinanceSpot => binance::spot_depth_request(symbol, depth),
            Self::OkxSpot => okx::books_request(symbol, depth),
            Self::BybitSpot => bybit::orderbook_request("spot", MarketType::Spot, symbol, depth),
            Self::BybitLinear => bybit::orderbook_request("linear", MarketType::Futures, symbol, depth),
        }
    }

    pub fn parse(&self, body: &Value) -> Result<RawBook, FetchError> {
        match self {
            Self::BinanceSpot => binance::json_parser::parse_depth(body),
            Self::OkxSpot => okx::json_parser::parse_books(body),
            Self::BybitSpot | Self::BybitLinear => bybit::json_parser::parse_orderbook(body),
        }
    }
}

pub struct RestFetcher {
    venue: RestVenue,
    base_url: String,
    client: reqwest::Client,
}

impl RestFetcher {
    /// `base_url` overrides the venue's public endpoint (tests, proxies).
    pub fn new(venue: RestVenue, base_url: Option<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let base_url = base_url.unwrap_or_else(|| venue.default_base_url().to_string());
        Ok(Self { venue, base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    pub fn venue(&self) -> RestVenue {
        self.venue
    }
}

#[async_trait]
impl SnapshotFetcher for RestFetcher {
    fn exchange(&self) -> Exchange {
        self.venue.exchange()
    }

    fn market_type(&self) -> MarketType {
        self.venue.market_type()
    }

    async fn fetch_one(&self, symbol: &str, depth: u32, timeout: Duration) -> Result<RawBook, FetchError> {
        let req = self.venue.request(symbol, depth);
        let url = format!("{}{}", self.base_url, req.path);

        let resp = self
            .client
            .get(&url)
            .query(&req.query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(FetchError::HttpStatus { status: status.as_u16(), body });
        }

        let body = resp.bytes().await.map_err(|e| map_reqwest_error(e, timeout))?;
        let value: Value = serde_json::from_slice(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        debug!("[rest {}/{}] {symbol}: {} bytes", self.exchange(), self.market_type(), body.len());
        self.venue.parse(&value)
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() { FetchError::Timeout(timeout) } else { FetchError::Transport(e.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::{ChannelPublisher, normalize_and_publish};
    use bookfeed_core::metrics::MetricsRegistry;
    use bookfeed_core::types::PriceLevel;
    use rust_decimal::Decimal;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Minimal HTTP/1.1 responder: answers every request with `status`/`body`
    /// and reports each request line.
    async fn serve(status: u16, body: &'static str, delay: Duration) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = sock.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]).to_string();
                    let _ = tx.send(head.lines().next().unwrap_or_default().to_string());
                    tokio::time::sleep(delay).await;
                    let resp = format!(
                        "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        (format!("http://{addr}"), rx)
    }

    #[tokio::test]
    async fn rest_snapshot_end_to_end() {
        let (base, mut requests) = serve(200, r#"{"bids":[["100","1"]],"asks":[["101","2"]]}"#, Duration::ZERO).await;
        let fetcher = RestFetcher::new(RestVenue::BinanceSpot, Some(base)).unwrap();
        let raw = fetcher.fetch_one("BTCUSDT", 1, Duration::from_secs(2)).await.unwrap();

        let line = requests.recv().await.unwrap();
        assert!(line.starts_with("GET /api/v3/depth?symbol=BTCUSDT&limit=1 "), "{line}");

        let metrics = MetricsRegistry::new();
        let (publisher, mut rx) = ChannelPublisher::new();
        normalize_and_publish(&publisher, &metrics, Exchange::Binance, MarketType::Spot, "BTCUSDT", raw, 1)
            .await
            .unwrap();
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.bids, vec![PriceLevel::new(Decimal::from(100), Decimal::from(1))]);
        assert_eq!(snap.asks, vec![PriceLevel::new(Decimal::from(101), Decimal::from(2))]);
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let (base, _rx) = serve(429, r#"{"code":-1003,"msg":"Too many requests"}"#, Duration::ZERO).await;
        let fetcher = RestFetcher::new(RestVenue::BinanceSpot, Some(base)).unwrap();
        match fetcher.fetch_one("BTCUSDT", 5, Duration::from_secs(2)).await {
            Err(FetchError::HttpStatus { status: 429, body }) => assert!(body.contains("Too many")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_2xx_is_an_error() {
        let (base, _rx) = serve(206, r#"{"bids":[],"asks":[]}"#, Duration::ZERO).await;
        let fetcher = RestFetcher::new(RestVenue::BinanceSpot, Some(base)).unwrap();
        let r = fetcher.fetch_one("BTCUSDT", 5, Duration::from_secs(2)).await;
        assert!(matches!(r, Err(FetchError::HttpStatus { status: 206, .. })), "{r:?}");
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let (base, _rx) = serve(200, "{}", Duration::from_secs(5)).await;
        let fetcher = RestFetcher::new(RestVenue::OkxSpot, Some(base)).unwrap();
        let r = fetcher.fetch_one("BTC-USDT", 5, Duration::from_millis(100)).await;
        assert!(matches!(r, Err(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn bybit_query_carries_category() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"b":[["1","1"]],"a":[["2","1"]],"u":3,"ts":4}}"#;
        let (base, mut requests) = serve(200, body, Duration::ZERO).await;
        let fetcher = RestFetcher::new(RestVenue::BybitLinear, Some(format!("{base}/"))).unwrap();
        let raw = fetcher.fetch_one("BTCUSDT", 1000, Duration::from_secs(2)).await.unwrap();
        assert_eq!(raw.sequence_id, Some(3));
        let line = requests.recv().await.unwrap();
        assert!(line.contains("/v5/market/orderbook?category=linear&symbol=BTCUSDT&limit=500"), "{line}");
    }
}
