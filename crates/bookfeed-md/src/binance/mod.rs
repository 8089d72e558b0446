//! Binance order-book snapshots.
//!
//! - Spot: REST `GET /api/v3/depth` (`api.binance.com`), limit 1..=5000
//! - USDⓈ-M futures: WebSocket API method `depth` (`ws-fapi.binance.com`),
//!   limit one of 5, 10, 20, 50, 100, 500, 1000

pub mod json_parser;

use serde_json::json;

use crate::json_util::nearest_allowed;
use crate::rest::RestRequest;

pub const SPOT_REST_URL: &str = "https://api.binance.com";
pub const FUTURES_WS_API_URL: &str = "wss://ws-fapi.binance.com/ws-fapi/v1";

const SPOT_MAX_DEPTH: u32 = 5000;
const FUTURES_DEPTHS: [u32; 7] = [5, 10, 20, 50, 100, 500, 1000];

pub fn spot_depth(requested: u32) -> u32 {
    requested.clamp(1, SPOT_MAX_DEPTH)
}

pub fn futures_depth(requested: u32) -> u32 {
    nearest_allowed(requested, &FUTURES_DEPTHS)
}

/// REST depth request for a spot symbol.
pub fn spot_depth_request(symbol: &str, depth: u32) -> RestRequest {
    RestRequest {
        path: "/api/v3/depth",
        query: vec![("symbol", symbol.to_uppercase()), ("limit", spot_depth(depth).to_string())],
    }
}

/// WebSocket API `depth` request frame.
pub fn futures_depth_request(id: u64, symbol: &str, depth: u32) -> String {
    json!({
        "id": id,
        "method": "depth",
        "params": { "symbol": symbol.to_uppercase(), "limit": futures_depth(depth) }
    })
    .to_string()
}
