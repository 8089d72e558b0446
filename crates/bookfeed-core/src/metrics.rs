//! In-process labelled metrics: counters, gauges and fixed-bucket histograms.
//!
//! A single [`MetricsRegistry`] is shared by `Arc` between every scheduler of
//! a worker. It can render Prometheus text exposition or a JSON snapshot; the
//! JSON form is what a worker ships to its supervisor in `metrics` messages.
//! Wiring to an actual metrics backend is left to the embedding process.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

/// Metric names emitted by the snapshot pipeline.
pub mod names {
    /// `{exchange, market_type, symbol, status}`
    pub const SNAPSHOT_REQUESTS_TOTAL: &str = "snapshot_requests_total";
    /// `{exchange, market_type, symbol}`
    pub const SNAPSHOT_REQUEST_DURATION_SECONDS: &str = "snapshot_request_duration_seconds";
    /// `{exchange, market_type, symbol}`
    pub const SNAPSHOT_TIMEOUTS_TOTAL: &str = "snapshot_timeouts_total";
    /// `{exchange, market_type}`
    pub const SNAPSHOT_RECONNECTIONS_TOTAL: &str = "snapshot_reconnections_total";
    /// `{exchange, market_type, symbol}`
    pub const SNAPSHOT_SKIPPED_TICKS_TOTAL: &str = "snapshot_skipped_ticks_total";
    /// `{exchange, symbol}`
    pub const ORDERBOOK_UPDATES_TOTAL: &str = "orderbook_updates_total";
    /// `{exchange, symbol}`
    pub const LAST_ORDERBOOK_UPDATE_TIMESTAMP: &str = "last_orderbook_update_timestamp";
}

/// Histogram bucket upper bounds in seconds. Samples above the last bound
/// land in the implicit `+Inf` bucket.
const BUCKETS_SECS: [f64; 12] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 10.0];

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Summary statistics of a histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Percentiles are bucket upper bounds (or `max` for the overflow bucket).
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

#[derive(Debug, Clone)]
struct Histogram {
    /// One slot per bound plus the overflow bucket. Not cumulative.
    bins: [u64; BUCKETS_SECS.len() + 1],
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    fn new() -> Self {
        Self { bins: [0; BUCKETS_SECS.len() + 1], count: 0, sum: 0.0, min: f64::MAX, max: 0.0 }
    }

    fn record(&mut self, value: f64) {
        let value = value.max(0.0);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let bin = BUCKETS_SECS.iter().position(|&b| value <= b).unwrap_or(BUCKETS_SECS.len());
        self.bins[bin] += 1;
    }

    fn percentile(&self, pct: f64) -> f64 {
        let target = ((self.count as f64) * pct).ceil().max(1.0) as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.bins.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return BUCKETS_SECS.get(i).copied().unwrap_or(self.max).min(self.max);
            }
        }
        self.max
    }

    fn summary(&self) -> Option<HistogramSummary> {
        if self.count == 0 {
            return None;
        }
        Some(HistogramSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            p50: self.percentile(0.50),
            p90: self.percentile(0.90),
            p99: self.percentile(0.99),
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Sorted label set; part of the series key.
type Labels = Vec<(String, String)>;

fn to_labels(labels: &[(&str, &str)]) -> Labels {
    let mut out: Labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    out.sort();
    out
}

#[derive(Default)]
struct Series {
    counters: BTreeMap<(String, Labels), u64>,
    gauges: BTreeMap<(String, Labels), f64>,
    histograms: BTreeMap<(String, Labels), Histogram>,
}

/// Thread-safe metrics registry.
///
/// Every accessor takes the lock for the duration of a single map operation.
/// A poisoned lock is recovered rather than propagated: metrics must never
/// take the pipeline down.
#[derive(Default)]
pub struct MetricsRegistry {
    inner: Mutex<Series>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Series) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        let key = (name.to_string(), to_labels(labels));
        self.with(|s| *s.counters.entry(key).or_insert(0) += by);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), to_labels(labels));
        self.with(|s| {
            s.gauges.insert(key, value);
        });
    }

    /// Record one histogram observation (seconds).
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), to_labels(labels));
        self.with(|s| s.histograms.entry(key).or_insert_with(Histogram::new).record(value));
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), to_labels(labels));
        self.with(|s| s.counters.get(&key).copied().unwrap_or(0))
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = (name.to_string(), to_labels(labels));
        self.with(|s| s.gauges.get(&key).copied())
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSummary> {
        let key = (name.to_string(), to_labels(labels));
        self.with(|s| s.histograms.get(&key).and_then(Histogram::summary))
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.with(|s| s.counters.iter().filter(|((n, _), _)| n == name).map(|(_, v)| *v).sum())
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        self.with(|s| {
            let mut out = String::new();
            let mut last_name = "";
            for ((name, labels), value) in &s.counters {
                if name != last_name {
                    let _ = writeln!(out, "# TYPE {name} counter");
                    last_name = name.as_str();
                }
                let _ = writeln!(out, "{name}{} {value}", fmt_labels(labels, None));
            }
            last_name = "";
            for ((name, labels), value) in &s.gauges {
                if name != last_name {
                    let _ = writeln!(out, "# TYPE {name} gauge");
                    last_name = name.as_str();
                }
                let _ = writeln!(out, "{name}{} {value}", fmt_labels(labels, None));
            }
            last_name = "";
            for ((name, labels), h) in &s.histograms {
                if name != last_name {
                    let _ = writeln!(out, "# TYPE {name} histogram");
                    last_name = name.as_str();
                }
                let mut cumulative = 0u64;
                for (i, bound) in BUCKETS_SECS.iter().enumerate() {
                    cumulative += h.bins[i];
                    let le = bound.to_string();
                    let _ = writeln!(out, "{name}_bucket{} {cumulative}", fmt_labels(labels, Some(&le)));
                }
                let _ = writeln!(out, "{name}_bucket{} {}", fmt_labels(labels, Some("+Inf")), h.count);
                let _ = writeln!(out, "{name}_sum{} {}", fmt_labels(labels, None), h.sum);
                let _ = writeln!(out, "{name}_count{} {}", fmt_labels(labels, None), h.count);
            }
            out
        })
    }

    /// JSON snapshot: `{"counters": [...], "gauges": [...], "histograms": [...]}`,
    /// each entry `{"name", "labels": {..}, "value" | "summary"}`.
    pub fn snapshot_json(&self) -> Value {
        self.with(|s| {
            let counters: Vec<Value> = s
                .counters
                .iter()
                .map(|((name, labels), v)| {
                    serde_json::json!({ "name": name, "labels": labels_json(labels), "value": v })
                })
                .collect();
            let gauges: Vec<Value> = s
                .gauges
                .iter()
                .map(|((name, labels), v)| {
                    serde_json::json!({ "name": name, "labels": labels_json(labels), "value": v })
                })
                .collect();
            let histograms: Vec<Value> = s
                .histograms
                .iter()
                .filter_map(|((name, labels), h)| {
                    let summary = h.summary()?;
                    Some(serde_json::json!({
                        "name": name,
                        "labels": labels_json(labels),
                        "summary": summary,
                    }))
                })
                .collect();
            serde_json::json!({ "counters": counters, "gauges": gauges, "histograms": histograms })
        })
    }
}

fn fmt_labels(labels: &Labels, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    format!("{{{}}}", parts.join(","))
}

fn labels_json(labels: &Labels) -> Value {
    Value::Object(labels.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_label_set() {
        let m = MetricsRegistry::new();
        let a = [("exchange", "binance"), ("symbol", "BTCUSDT")];
        let b = [("symbol", "BTCUSDT"), ("exchange", "binance")];
        m.inc_counter(names::ORDERBOOK_UPDATES_TOTAL, &a);
        m.add_counter(names::ORDERBOOK_UPDATES_TOTAL, &b, 2);
        m.inc_counter(names::ORDERBOOK_UPDATES_TOTAL, &[("exchange", "okx"), ("symbol", "BTC-USDT")]);
        assert_eq!(m.counter(names::ORDERBOOK_UPDATES_TOTAL, &a), 3);
        assert_eq!(m.counter_total(names::ORDERBOOK_UPDATES_TOTAL), 4);
        assert_eq!(m.counter("missing", &[]), 0);
    }

    #[test]
    fn gauges_overwrite() {
        let m = MetricsRegistry::new();
        let l = [("exchange", "bybit"), ("symbol", "ETHUSDT")];
        m.set_gauge(names::LAST_ORDERBOOK_UPDATE_TIMESTAMP, &l, 1.0);
        m.set_gauge(names::LAST_ORDERBOOK_UPDATE_TIMESTAMP, &l, 2.5);
        assert_eq!(m.gauge(names::LAST_ORDERBOOK_UPDATE_TIMESTAMP, &l), Some(2.5));
    }

    #[test]
    fn histogram_summary() {
        let m = MetricsRegistry::new();
        for i in 1..=100 {
            m.observe("d", &[], i as f64 / 1000.0); // 1ms .. 100ms
        }
        let s = m.histogram("d", &[]).unwrap();
        assert_eq!(s.count, 100);
        assert!((s.min - 0.001).abs() < 1e-12);
        assert!((s.max - 0.1).abs() < 1e-12);
        assert_eq!(s.p50, 0.05);
        assert_eq!(s.p99, 0.1);
        assert!(m.histogram("none", &[]).is_none());
    }

    #[test]
    fn overflow_bucket_reports_max() {
        let m = MetricsRegistry::new();
        m.observe("d", &[], 42.0);
        let s = m.histogram("d", &[]).unwrap();
        assert_eq!(s.p50, 42.0);
    }

    #[test]
    fn prometheus_rendering() {
        let m = MetricsRegistry::new();
        m.inc_counter(names::SNAPSHOT_RECONNECTIONS_TOTAL, &[("exchange", "deribit"), ("market_type", "options")]);
        m.observe(names::SNAPSHOT_REQUEST_DURATION_SECONDS, &[("symbol", "X")], 0.02);
        let text = m.render_prometheus();
        assert!(text.contains("# TYPE snapshot_reconnections_total counter"));
        assert!(text.contains(r#"snapshot_reconnections_total{exchange="deribit",market_type="options"} 1"#));
        assert!(text.contains(r#"snapshot_request_duration_seconds_bucket{symbol="X",le="0.025"} 1"#));
        assert!(text.contains(r#"snapshot_request_duration_seconds_bucket{symbol="X",le="0.01"} 0"#));
        assert!(text.contains(r#"snapshot_request_duration_seconds_count{symbol="X"} 1"#));
    }

    #[test]
    fn json_snapshot_shape() {
        let m = MetricsRegistry::new();
        m.inc_counter("c", &[("k", "v")]);
        m.set_gauge("g", &[], 1.5);
        m.observe("h", &[], 0.3);
        let v = m.snapshot_json();
        assert_eq!(v["counters"][0]["labels"]["k"], "v");
        assert_eq!(v["counters"][0]["value"], 1);
        assert_eq!(v["gauges"][0]["value"], 1.5);
        assert_eq!(v["histograms"][0]["summary"]["count"], 1);
    }
}
