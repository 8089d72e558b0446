//! Configuration parsing for the snapshot daemon.
//!
//! The supervisor and every worker read the same JSON file. The top-level
//! structure holds logging metadata, snapshot cadence defaults, supervision
//! policy and an `exchanges` array where each entry becomes one worker.
//!
//! # Example config
//!
//! ```json
//! {
//!   "logging": { "module_name": "bookfeed", "log_path": "/var/log/bookfeed" },
//!   "snapshot": { "interval_secs": 1.0, "depth": 100 },
//!   "supervisor": { "max_restart_attempts": 5, "heartbeat_timeout_secs": 30 },
//!   "exchanges": [{
//!     "exchange": "binance",
//!     "limits": { "memory_hard_limit_mb": 250 },
//!     "markets": [
//!       { "market_type": "spot", "symbols": ["BTCUSDT", "ETHUSDT"] },
//!       { "market_type": "futures", "symbols": ["BTCUSDT"], "depth": 50,
//!         "reconnect": { "initial_delay_ms": 250, "max_delay_ms": 10000 } }
//!     ]
//!   }]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::BookfeedError;
use crate::types::{Exchange, ExchangeClass, MarketType, ResourceLimitOverrides, ResourceLimits};
use crate::ws::ReconnectPolicy;

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Logging metadata (module name, log path, level).
    pub logging: Option<LoggingMeta>,

    /// Snapshot cadence defaults shared by every market.
    #[serde(default)]
    pub snapshot: SnapshotSettings,

    /// Supervision policy.
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// One entry per exchange worker.
    pub exchanges: Vec<ExchangeConfig>,
}

/// Logging metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    pub log_level: Option<String>,
}

/// Snapshot cadence defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotSettings {
    /// Tick interval in seconds (default: 1.0).
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,

    /// Book depth in levels per side (default: 100).
    #[serde(default = "default_depth")]
    pub depth: u32,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self { interval_secs: default_interval_secs(), depth: default_depth() }
    }
}

impl SnapshotSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

/// Supervision policy for worker processes.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_restart_cooldown_secs")]
    pub restart_cooldown_secs: f64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: f64,
    /// How often a worker sends a heartbeat.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: f64,
    /// How often a worker sends health and metrics.
    #[serde(default = "default_telemetry_interval_secs")]
    pub telemetry_interval_secs: f64,
    /// Poll interval of the per-worker monitor loop.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: f64,
    /// Grace period after `control_stop` before SIGTERM.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: f64,
    /// Grace period after SIGTERM before SIGKILL.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: f64,
    /// Restart a worker whose heartbeat went stale (default: only warn).
    #[serde(default)]
    pub restart_on_heartbeat_timeout: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restart_attempts: default_max_restart_attempts(),
            restart_cooldown_secs: default_restart_cooldown_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            telemetry_interval_secs: default_telemetry_interval_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            restart_on_heartbeat_timeout: false,
        }
    }
}

impl SupervisorSettings {
    /// Reject durations the accessors below cannot turn into a [`Duration`],
    /// and zero periods that would stall a timer.
    pub fn validate(&self) -> Result<(), BookfeedError> {
        for (name, secs) in [
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("telemetry_interval_secs", self.telemetry_interval_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("stop_timeout_secs", self.stop_timeout_secs),
        ] {
            check_secs(name, secs, false)?;
        }
        check_secs("restart_cooldown_secs", self.restart_cooldown_secs, true)?;
        check_secs("kill_grace_secs", self.kill_grace_secs, true)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.restart_cooldown_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.telemetry_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs_f64(self.kill_grace_secs)
    }
}

/// One exchange worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange identifier: `"binance"`, `"okx"`, `"bybit"`, `"deribit"`.
    /// Also used as the worker id.
    pub exchange: String,

    /// Disabled exchanges are ignored by the supervisor (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Resource profile; inferred from the markets when absent.
    pub class: Option<ExchangeClass>,

    /// Per-field overrides of the class resource limits.
    #[serde(default)]
    pub limits: ResourceLimitOverrides,

    /// Markets served by this worker.
    pub markets: Vec<MarketConfig>,
}

impl ExchangeConfig {
    /// Parse the `exchange` field.
    pub fn exchange_kind(&self) -> Result<Exchange, BookfeedError> {
        self.exchange.parse()
    }

    /// Configured class, or `derivatives_high` if any market is a derivative
    /// and `spot_high` otherwise.
    pub fn effective_class(&self) -> ExchangeClass {
        self.class.unwrap_or_else(|| {
            if self.markets.iter().any(|m| m.market_type.is_derivative()) {
                ExchangeClass::DerivativesHigh
            } else {
                ExchangeClass::SpotHigh
            }
        })
    }

    /// Class defaults with per-field overrides applied.
    pub fn resource_limits(&self) -> ResourceLimits {
        self.limits.apply(ResourceLimits::for_class(self.effective_class()))
    }
}

/// One `(exchange, market_type)` snapshot manager.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    pub market_type: MarketType,

    /// Symbols in the exchange's own format (e.g. `BTCUSDT`, `BTC-PERPETUAL`).
    pub symbols: Vec<String>,

    /// Depth override (default: `snapshot.depth`).
    pub depth: Option<u32>,

    /// Per-request timeout in milliseconds (default: 80% of the interval).
    pub request_timeout_ms: Option<u64>,

    /// REST base URL override.
    pub rest_url: Option<String>,

    /// WebSocket API URL override.
    pub ws_url: Option<String>,

    /// Reconnect backoff for WebSocket request/response sessions.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl MarketConfig {
    pub fn effective_depth(&self, snapshot: &SnapshotSettings) -> u32 {
        self.depth.unwrap_or(snapshot.depth).max(1)
    }

    /// Request timeout, always strictly below the tick interval.
    pub fn request_timeout(&self, snapshot: &SnapshotSettings) -> Duration {
        let interval = snapshot.interval();
        let cap = interval * 9 / 10;
        match self.request_timeout_ms {
            Some(ms) => Duration::from_millis(ms).min(cap),
            None => interval * 4 / 5,
        }
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl AppConfig {
    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), BookfeedError> {
        check_secs("snapshot.interval_secs", self.snapshot.interval_secs, false)?;
        self.supervisor.validate()?;
        if self.snapshot.depth == 0 {
            return Err(BookfeedError::Config("snapshot.depth must be >= 1".into()));
        }

        let mut seen = HashSet::new();
        for ex in &self.exchanges {
            ex.exchange_kind()?;
            if !seen.insert(ex.exchange.to_ascii_lowercase()) {
                return Err(BookfeedError::Config(format!("duplicate exchange: {}", ex.exchange)));
            }
            let limits = ex.resource_limits();
            if limits.memory_soft_limit_mb > limits.memory_hard_limit_mb {
                return Err(BookfeedError::Config(format!(
                    "{}: memory soft limit above hard limit",
                    ex.exchange
                )));
            }
            if ex.enabled {
                for m in &ex.markets {
                    if m.symbols.is_empty() {
                        return Err(BookfeedError::Config(format!(
                            "{}/{}: no symbols configured",
                            ex.exchange, m.market_type
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up an exchange entry by id (case-insensitive).
    pub fn exchange(&self, id: &str) -> Option<&ExchangeConfig> {
        self.exchanges.iter().find(|e| e.exchange.eq_ignore_ascii_case(id))
    }

    /// Exchanges the supervisor should launch.
    pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.enabled)
    }
}

/// `secs` must be finite, representable as a [`Duration`], and positive
/// (or zero when `allow_zero`).
fn check_secs(name: &str, secs: f64, allow_zero: bool) -> Result<(), BookfeedError> {
    let ok = Duration::try_from_secs_f64(secs).is_ok_and(|d| allow_zero || !d.is_zero());
    if ok {
        Ok(())
    } else {
        let bound = if allow_zero { ">= 0" } else { "> 0" };
        Err(BookfeedError::Config(format!("{name} must be finite and {bound}, got {secs}")))
    }
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn default_true() -> bool {
    true
}
fn default_interval_secs() -> f64 {
    1.0
}
fn default_depth() -> u32 {
    100
}
fn default_max_restart_attempts() -> u32 {
    5
}
fn default_restart_cooldown_secs() -> f64 {
    5.0
}
fn default_heartbeat_timeout_secs() -> f64 {
    30.0
}
fn default_heartbeat_interval_secs() -> f64 {
    5.0
}
fn default_telemetry_interval_secs() -> f64 {
    10.0
}
fn default_monitor_interval_secs() -> f64 {
    1.0
}
fn default_stop_timeout_secs() -> f64 {
    10.0
}
fn default_kill_grace_secs() -> f64 {
    3.0
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "logging": { "module_name": "bookfeed" },
        "snapshot": { "interval_secs": 1.0 },
        "exchanges": [
            { "exchange": "binance",
              "markets": [
                { "market_type": "spot", "symbols": ["BTCUSDT"] },
                { "market_type": "futures", "symbols": ["BTCUSDT"], "depth": 20,
                  "request_timeout_ms": 5000 }
              ] },
            { "exchange": "okx", "enabled": false, "class": "low_frequency",
              "limits": { "memory_hard_limit_mb": 120 },
              "markets": [ { "market_type": "spot", "symbols": [] } ] }
        ]
    }"#;

    #[test]
    fn parses_with_defaults() {
        let cfg: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.snapshot.depth, 100);
        assert_eq!(cfg.supervisor.max_restart_attempts, 5);
        assert!(!cfg.supervisor.restart_on_heartbeat_timeout);

        let binance = cfg.exchange("BINANCE").unwrap();
        assert_eq!(binance.exchange_kind().unwrap(), Exchange::Binance);
        assert_eq!(binance.effective_class(), ExchangeClass::DerivativesHigh);
        assert_eq!(binance.resource_limits().memory_hard_limit_mb, 200);

        let spot = &binance.markets[0];
        assert_eq!(spot.effective_depth(&cfg.snapshot), 100);
        assert_eq!(spot.request_timeout(&cfg.snapshot), Duration::from_millis(800));
        assert_eq!(spot.reconnect.policy().initial_delay, Duration::from_millis(500));

        let fut = &binance.markets[1];
        assert_eq!(fut.effective_depth(&cfg.snapshot), 20);
        // 5s configured, capped below the 1s interval.
        assert_eq!(fut.request_timeout(&cfg.snapshot), Duration::from_millis(900));
    }

    #[test]
    fn disabled_exchange_is_skipped_and_overrides_apply() {
        let cfg: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.enabled_exchanges().count(), 1);
        let okx = cfg.exchange("okx").unwrap();
        let limits = okx.resource_limits();
        assert_eq!(limits.memory_soft_limit_mb, 60);
        assert_eq!(limits.memory_hard_limit_mb, 120);
    }

    #[test]
    fn rejects_duplicates_and_empty_symbols() {
        let dup = r#"{ "exchanges": [
            { "exchange": "bybit", "markets": [] },
            { "exchange": "Bybit", "markets": [] } ] }"#;
        let cfg: AppConfig = serde_json::from_str(dup).unwrap();
        assert!(cfg.validate().is_err());

        let empty = r#"{ "exchanges": [
            { "exchange": "bybit", "markets": [ { "market_type": "spot", "symbols": [] } ] } ] }"#;
        let cfg: AppConfig = serde_json::from_str(empty).unwrap();
        assert!(cfg.validate().is_err());

        let unknown = r#"{ "exchanges": [ { "exchange": "kraken", "markets": [] } ] }"#;
        let cfg: AppConfig = serde_json::from_str(unknown).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_durations_that_cannot_run() {
        let base: AppConfig = serde_json::from_str(SAMPLE).unwrap();
        base.validate().unwrap();

        let reject = |edit: &dyn Fn(&mut AppConfig)| {
            let mut cfg = base.clone();
            edit(&mut cfg);
            assert!(cfg.validate().is_err());
        };
        reject(&|c| c.supervisor.monitor_interval_secs = -1.0);
        reject(&|c| c.supervisor.monitor_interval_secs = 0.0);
        reject(&|c| c.supervisor.heartbeat_interval_secs = 0.0);
        reject(&|c| c.supervisor.telemetry_interval_secs = f64::NAN);
        reject(&|c| c.supervisor.heartbeat_timeout_secs = f64::INFINITY);
        reject(&|c| c.supervisor.stop_timeout_secs = -0.5);
        reject(&|c| c.supervisor.restart_cooldown_secs = -1.0);
        reject(&|c| c.supervisor.kill_grace_secs = f64::NAN);
        reject(&|c| c.snapshot.interval_secs = f64::INFINITY);
        reject(&|c| c.snapshot.interval_secs = 1e30);

        let mut cfg = base.clone();
        cfg.supervisor.restart_cooldown_secs = 0.0;
        cfg.supervisor.kill_grace_secs = 0.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.exchanges.len(), 2);
        assert!(load_config(Path::new("/definitely/not/here.json")).is_err());
    }
}
