//! WebSocket request/response session with auto-reconnect.

pub mod session;

use std::time::Duration;

pub use session::{OnReconnectCallback, RequestError, WsRequestSession, WsSessionConfig};

/// Exponential reconnect backoff: `initial_delay`, multiplied by `multiplier`
/// after every failed or lost connection, capped at `max_delay`. Resets to
/// `initial_delay` once a connection is established.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay to use after `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 { self.multiplier } else { 1.0 };
        let next = current.as_secs_f64() * multiplier;
        if next >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(next)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let p = ReconnectPolicy::default();
        let mut d = p.initial_delay;
        let mut seen = vec![d];
        for _ in 0..8 {
            d = p.next_delay(d);
            seen.push(d);
        }
        assert_eq!(seen[1], Duration::from_secs(1));
        assert_eq!(seen[2], Duration::from_secs(2));
        assert_eq!(*seen.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn sub_unit_multiplier_never_shrinks() {
        let p = ReconnectPolicy { multiplier: 0.5, ..Default::default() };
        assert_eq!(p.next_delay(Duration::from_secs(2)), Duration::from_secs(2));
    }
}
