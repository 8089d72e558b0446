//! OKX spot order-book snapshots via REST `GET /api/v5/market/books`.
//!
//! Instrument ids use the `BASE-QUOTE` form (`BTC-USDT`); `sz` is 1..=400.

pub mod json_parser;

use crate::rest::RestRequest;

pub const REST_URL: &str = "https://www.okx.com";

const MAX_DEPTH: u32 = 400;

pub fn depth(requested: u32) -> u32 {
    requested.clamp(1, MAX_DEPTH)
}

pub fn books_request(inst_id: &str, requested_depth: u32) -> RestRequest {
    RestRequest {
        path: "/api/v5/market/books",
        query: vec![("instId", inst_id.to_uppercase()), ("sz", depth(requested_depth).to_string())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_clamped() {
        assert_eq!(depth(0), 1);
        assert_eq!(depth(1000), 400);
        let r = books_request("btc-usdt", 50);
        assert_eq!(r.query[0], ("instId", "BTC-USDT".to_string()));
        assert_eq!(r.query[1], ("sz", "50".to_string()));
    }
}
