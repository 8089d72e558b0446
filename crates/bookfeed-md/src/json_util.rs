//! Shared JSON parsing helpers used by all exchange modules.
//!
//! Exchanges encode prices and quantities either as JSON strings
//! (`"30000.5"`) or as native numbers (`30000.5`). Both are parsed exactly
//! into [`Decimal`]; nothing goes through `f64` arithmetic.

use std::str::FromStr;

use bookfeed_core::types::PriceLevel;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::FetchError;

/// Parse a JSON value (string or number) as [`Decimal`].
pub fn parse_decimal(v: &Value) -> Option<Decimal> {
    let text = match v {
        Value::String(s) => s.as_str().trim().to_string(),
        // `Number`'s Display is the shortest round-trip representation.
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text)).ok()
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a `[[price, qty, ...], ...]` array into price levels.
///
/// Extra elements after the quantity (order counts, liquidation flags) are
/// ignored. Any level that cannot be parsed rejects the whole side.
pub fn parse_levels(v: Option<&Value>, side: &str) -> Result<Vec<PriceLevel>, FetchError> {
    let arr = v
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Malformed(format!("missing {side} array")))?;

    arr.iter()
        .enumerate()
        .map(|(i, level)| {
            let pair = level.as_array().filter(|a| a.len() >= 2).ok_or_else(|| {
                FetchError::Malformed(format!("{side}[{i}] is not a [price, qty] pair"))
            })?;
            let price = parse_decimal(&pair[0])
                .ok_or_else(|| FetchError::Malformed(format!("{side}[{i}] bad price {}", pair[0])))?;
            let quantity = parse_decimal(&pair[1])
                .ok_or_else(|| FetchError::Malformed(format!("{side}[{i}] bad quantity {}", pair[1])))?;
            Ok(PriceLevel::new(price, quantity))
        })
        .collect()
}

/// Smallest allowed value `>= requested`, or the largest allowed value.
pub fn nearest_allowed(requested: u32, allowed: &[u32]) -> u32 {
    allowed
        .iter()
        .copied()
        .find(|&a| a >= requested)
        .or_else(|| allowed.last().copied())
        .unwrap_or(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn decimals_from_strings_and_numbers() {
        assert_eq!(parse_decimal(&json!("100.10")), Some(d("100.10")));
        assert_eq!(parse_decimal(&json!(30000.5)), Some(d("30000.5")));
        assert_eq!(parse_decimal(&json!(7)), Some(d("7")));
        assert_eq!(parse_decimal(&json!("1e-5")), Some(d("0.00001")));
        assert_eq!(parse_decimal(&json!("abc")), None);
        assert_eq!(parse_decimal(&json!(null)), None);
    }

    #[test]
    fn levels_ignore_extra_fields() {
        let v = json!([["100", "1", "0", "4"], [99.5, 2]]);
        let levels = parse_levels(Some(&v), "bids").unwrap();
        assert_eq!(levels, vec![PriceLevel::new(d("100"), d("1")), PriceLevel::new(d("99.5"), d("2"))]);
    }

    #[test]
    fn bad_level_rejects_side() {
        let v = json!([["100", "1"], ["x", "1"]]);
        assert!(matches!(parse_levels(Some(&v), "asks"), Err(FetchError::Malformed(_))));
        let v = json!([["100"]]);
        assert!(parse_levels(Some(&v), "asks").is_err());
        assert!(parse_levels(None, "asks").is_err());
    }

    #[test]
    fn u64_from_strings_and_numbers() {
        assert_eq!(parse_str_u64(Some(&json!("42"))), Some(42));
        assert_eq!(parse_str_u64(Some(&json!(42))), Some(42));
        assert_eq!(parse_str_u64(None), None);
    }

    #[test]
    fn nearest_allowed_rounds_up_then_caps() {
        let allowed = [5, 10, 20, 50, 100, 500, 1000];
        assert_eq!(nearest_allowed(1, &allowed), 5);
        assert_eq!(nearest_allowed(20, &allowed), 20);
        assert_eq!(nearest_allowed(30, &allowed), 50);
        assert_eq!(nearest_allowed(5000, &allowed), 1000);
    }
}
