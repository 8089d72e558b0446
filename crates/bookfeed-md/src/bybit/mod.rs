//! Bybit v5 order-book snapshots via REST `GET /v5/market/orderbook`.
//!
//! Spot uses `category=spot` (limit 1..=200); USDT perpetuals use
//! `category=linear` (limit 1..=500).

pub mod json_parser;

use bookfeed_core::types::MarketType;

use crate::rest::RestRequest;

pub const REST_URL: &str = "https://api.bybit.com";

const SPOT_MAX_DEPTH: u32 = 200;
const LINEAR_MAX_DEPTH: u32 = 500;

/// Bybit `category` for a market, if supported.
pub fn category(market_type: MarketType) -> Option<&'static str> {
    match market_type {
        MarketType::Spot => Some("spot"),
        MarketType::Futures => Some("linear"),
        MarketType::Options => None,
    }
}

pub fn depth(market_type: MarketType, requested: u32) -> u32 {
    let max = if market_type == MarketType::Spot { SPOT_MAX_DEPTH } else { LINEAR_MAX_DEPTH };
    requested.clamp(1, max)
}

pub fn orderbook_request(category: &'static str, market_type: MarketType, symbol: &str, requested: u32) -> RestRequest {
    RestRequest {
        path: "/v5/market/orderbook",
        query: vec![
            ("category", category.to_string()),
            ("symbol", symbol.to_uppercase()),
            ("limit", depth(market_type, requested).to_string()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_and_limits() {
        assert_eq!(category(MarketType::Spot), Some("spot"));
        assert_eq!(category(MarketType::Futures), Some("linear"));
        assert_eq!(category(MarketType::Options), None);
        assert_eq!(depth(MarketType::Spot, 1000), 200);
        assert_eq!(depth(MarketType::Futures, 1000), 500);

        let r = orderbook_request("linear", MarketType::Futures, "btcusdt", 100);
        assert_eq!(r.query[0].1, "linear");
        assert_eq!(r.query[1].1, "BTCUSDT");
        assert_eq!(r.query[2].1, "100");
    }
}
