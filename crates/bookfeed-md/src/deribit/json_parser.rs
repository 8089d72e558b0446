//! Deribit `public/get_order_book` response parser.
//!
//! ```json
//! {"jsonrpc": "2.0", "id": 7, "result": {
//!     "instrument_name": "BTC-PERPETUAL", "timestamp": 1700000000000, "change_id": 6897,
//!     "bids": [[37000.5, 1250.0]], "asks": [[37001.0, 300.0]]
//! }}
//! ```
//!
//! Errors: `{"jsonrpc": "2.0", "id": 7, "error": {"code": 10009, "message": "..."}}`.

use serde_json::Value;

use crate::json_util::{parse_levels, parse_str_u64};
use crate::{FetchError, RawBook};

pub fn parse_response(v: &Value) -> Result<RawBook, FetchError> {
    if let Some(err) = v.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
        let msg = err.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(FetchError::Rejected(format!("{code}: {msg}")));
    }
    let result = v.get("result").ok_or_else(|| FetchError::Malformed("missing result".into()))?;

    Ok(RawBook {
        bids: parse_levels(result.get("bids"), "bids")?,
        asks: parse_levels(result.get("asks"), "asks")?,
        sequence_id: parse_str_u64(result.get("change_id")),
        exchange_timestamp_ms: parse_str_u64(result.get("timestamp")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_levels() {
        let v = json!({"jsonrpc": "2.0", "id": 7, "result": {
            "instrument_name": "BTC-PERPETUAL", "timestamp": 1700000000000u64, "change_id": 6897,
            "bids": [[37000.5, 1250.0]], "asks": [[37001.0, 300.0]]
        }});
        let raw = parse_response(&v).unwrap();
        assert_eq!(raw.bids[0].price.to_string(), "37000.5");
        assert_eq!(raw.asks[0].quantity, rust_decimal::Decimal::from(300));
        assert_eq!(raw.sequence_id, Some(6897));
    }

    #[test]
    fn rpc_error() {
        let v = json!({"jsonrpc": "2.0", "id": 7, "error": {"code": 10009, "message": "not_enough_funds"}});
        assert!(matches!(parse_response(&v), Err(FetchError::Rejected(_))));
    }
}
