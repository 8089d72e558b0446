//! Deribit order-book snapshots over the JSON-RPC WebSocket API
//! (`public/get_order_book`), shared by futures and options.
//!
//! Allowed depths: 1, 5, 10, 20, 50, 100, 1000, 10000.

pub mod json_parser;

use serde_json::json;

use crate::json_util::nearest_allowed;

pub const WS_API_URL: &str = "wss://www.deribit.com/ws/api/v2";

const DEPTHS: [u32; 8] = [1, 5, 10, 20, 50, 100, 1000, 10000];

pub fn depth(requested: u32) -> u32 {
    nearest_allowed(requested, &DEPTHS)
}

/// JSON-RPC request frame. Instrument names are case-sensitive
/// (`BTC-PERPETUAL`, `BTC-27JUN25-100000-C`) and passed through unchanged.
pub fn order_book_request(id: u64, instrument: &str, requested: u32) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "public/get_order_book",
        "params": { "instrument_name": instrument, "depth": depth(requested) }
    })
    .to_string()
}
