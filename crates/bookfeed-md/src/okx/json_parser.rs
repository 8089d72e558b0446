//! OKX `market/books` response parser.
//!
//! ```json
//! {"code": "0", "msg": "", "data": [{
//!     "asks": [["41006.8", "0.60038921", "0", "1"]],
//!     "bids": [["41006.3", "0.30178218", "0", "2"]],
//!     "ts": "1629966436396", "seqId": 3000000000
//! }]}
//! ```

use serde_json::Value;

use crate::json_util::{parse_levels, parse_str_u64};
use crate::{FetchError, RawBook};

pub fn parse_books(v: &Value) -> Result<RawBook, FetchError> {
    let code = match v.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(FetchError::Malformed("missing code".into())),
    };
    if code != "0" {
        let msg = v.get("msg").and_then(Value::as_str).unwrap_or("");
        return Err(FetchError::Rejected(format!("code {code}: {msg}")));
    }

    let book = v
        .get("data")
        .and_then(Value::as_array)
        .and_then(|d| d.first())
        .ok_or_else(|| FetchError::Malformed("empty data".into()))?;

    Ok(RawBook {
        bids: parse_levels(book.get("bids"), "bids")?,
        asks: parse_levels(book.get("asks"), "asks")?,
        sequence_id: parse_str_u64(book.get("seqId")),
        exchange_timestamp_ms: parse_str_u64(book.get("ts")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_book() {
        let v = json!({"code": "0", "msg": "", "data": [{
            "asks": [["41006.8", "0.60038921", "0", "1"]],
            "bids": [["41006.3", "0.30178218", "0", "2"], ["41006.1", "0.1", "0", "1"]],
            "ts": "1629966436396", "seqId": 3000000000u64
        }]});
        let raw = parse_books(&v).unwrap();
        assert_eq!(raw.bids.len(), 2);
        assert_eq!(raw.asks[0].price.to_string(), "41006.8");
        assert_eq!(raw.sequence_id, Some(3_000_000_000));
        assert_eq!(raw.exchange_timestamp_ms, Some(1_629_966_436_396));
    }

    #[test]
    fn error_code_is_rejection() {
        let v = json!({"code": "51001", "msg": "Instrument ID does not exist", "data": []});
        assert!(matches!(parse_books(&v), Err(FetchError::Rejected(_))));
        let v = json!({"code": "0", "msg": "", "data": []});
        assert!(matches!(parse_books(&v), Err(FetchError::Malformed(_))));
    }
}
