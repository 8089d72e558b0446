//! Binance depth payload parser.
//!
//! The REST body and the WebSocket API `result` share one layout:
//!
//! ```json
//! {"lastUpdateId": 1027024, "E": 1589436922972, "T": 1589436922959,
//!  "bids": [["4.00000000", "431.00000000"]], "asks": [["4.00000200", "12.00000000"]]}
//! ```
//!
//! `E`/`T` are only present on futures.

use serde_json::Value;

use crate::json_util::{parse_levels, parse_str_u64};
use crate::{FetchError, RawBook};

/// Parse a depth object (REST body or WS API `result`).
pub fn parse_depth(v: &Value) -> Result<RawBook, FetchError> {
    Ok(RawBook {
        bids: parse_levels(v.get("bids"), "bids")?,
        asks: parse_levels(v.get("asks"), "asks")?,
        sequence_id: parse_str_u64(v.get("lastUpdateId")),
        exchange_timestamp_ms: parse_str_u64(v.get("T")).or_else(|| parse_str_u64(v.get("E"))),
    })
}

/// Parse a WebSocket API response frame.
///
/// Success: `{"id": 1, "status": 200, "result": {...}}`.
/// Failure: `{"id": 1, "status": 400, "error": {"code": -1121, "msg": "Invalid symbol."}}`.
pub fn parse_ws_api_response(v: &Value) -> Result<RawBook, FetchError> {
    if let Some(err) = v.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
        let msg = err.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(FetchError::Rejected(format!("{code}: {msg}")));
    }
    let status = v.get("status").and_then(Value::as_u64).unwrap_or(200);
    if status != 200 {
        return Err(FetchError::Rejected(format!("status {status}")));
    }
    let result = v.get("result").ok_or_else(|| FetchError::Malformed("missing result".into()))?;
    parse_depth(result)
}
