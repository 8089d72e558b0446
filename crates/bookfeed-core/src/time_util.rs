//! Wall-clock time helpers.
//!
//! Order-book snapshots carry microsecond timestamps; control messages carry
//! fractional seconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
fn since_epoch() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    since_epoch().as_micros() as u64
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    since_epoch().as_millis() as u64
}

/// Current time as fractional **seconds** since Unix epoch.
#[inline]
pub fn now_secs_f64() -> f64 {
    since_epoch().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_agree() {
        let us = now_us();
        let ms = now_ms();
        let secs = now_secs_f64();
        assert!(ms >= us / 1000);
        assert!((secs - us as f64 / 1e6).abs() < 1.0);
    }
}
