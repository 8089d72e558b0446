//! Bybit v5 `market/orderbook` response parser.
//!
//! ```json
//! {"retCode": 0, "retMsg": "OK", "result": {
//!     "s": "BTCUSDT", "b": [["65485.47", "47.081829"]], "a": [["65557.7", "16.606555"]],
//!     "ts": 1716863719031, "u": 230704, "seq": 1432604333
//! }, "time": 1716863719382}
//! ```

use serde_json::Value;

use crate::json_util::{parse_levels, parse_str_u64};
use crate::{FetchError, RawBook};

pub fn parse_orderbook(v: &Value) -> Result<RawBook, FetchError> {
    let ret_code = v
        .get("retCode")
        .and_then(Value::as_i64)
        .ok_or_else(|| FetchError::Malformed("missing retCode".into()))?;
    if ret_code != 0 {
        let msg = v.get("retMsg").and_then(Value::as_str).unwrap_or("");
        return Err(FetchError::Rejected(format!("retCode {ret_code}: {msg}")));
    }
    let result = v.get("result").ok_or_else(|| FetchError::Malformed("missing result".into()))?;

    Ok(RawBook {
        bids: parse_levels(result.get("b"), "bids")?,
        asks: parse_levels(result.get("a"), "asks")?,
        sequence_id: parse_str_u64(result.get("u")),
        exchange_timestamp_ms: parse_str_u64(result.get("ts")),
    })
}
