//! Fixed-cadence snapshot scheduler shared by every exchange adapter.
//!
//! ```text
//! next_tick = now
//! loop:
//!     next_tick += interval
//!     for symbol in symbols:
//!         if symbol's previous fetch still running: skip it this tick
//!         else: spawn fetch_one(symbol) → normalize → publish
//!     sleep_until(next_tick)
//! ```
//!
//! The loop never awaits a fetch, so a slow symbol neither delays its
//! siblings nor drifts the cadence. Each symbol has at most one fetch in
//! flight; the join handle of that fetch is owned by the loop itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use bookfeed_core::metrics::{MetricsRegistry, names};
use bookfeed_core::time_util;
use bookfeed_core::types::{Exchange, FetchStatus, MarketType, SymbolSyncState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::publish::{SnapshotPublisher, normalize_and_publish};
use crate::{FetchError, SnapshotFetcher};

/// Static parameters of one `(exchange, market_type)` scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub symbols: Vec<String>,
    pub interval: Duration,
    pub request_timeout: Duration,
    pub depth: u32,
}

type SyncStates = Arc<Mutex<AHashMap<String, SymbolSyncState>>>;

/// Everything a fetch task needs, cloned cheaply per spawn.
#[derive(Clone)]
struct FetchContext {
    label: Arc<str>,
    fetcher: Arc<dyn SnapshotFetcher>,
    publisher: Arc<dyn SnapshotPublisher>,
    metrics: Arc<MetricsRegistry>,
    states: SyncStates,
    request_timeout: Duration,
    depth: u32,
}

pub struct SnapshotScheduler {
    label: String,
    config: SchedulerConfig,
    ctx: FetchContext,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl SnapshotScheduler {
    pub fn new(
        config: SchedulerConfig,
        fetcher: Arc<dyn SnapshotFetcher>,
        publisher: Arc<dyn SnapshotPublisher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let label = format!("{}/{}", fetcher.exchange(), fetcher.market_type());
        let states: AHashMap<_, _> =
            config.symbols.iter().map(|s| (s.clone(), SymbolSyncState::new(s.clone()))).collect();
        let ctx = FetchContext {
            label: Arc::from(label.as_str()),
            fetcher,
            publisher,
            metrics,
            states: Arc::new(Mutex::new(states)),
            request_timeout: config.request_timeout,
            depth: config.depth,
        };
        Self { label, config, ctx, shutdown_tx: None, task: None }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn exchange(&self) -> Exchange {
        self.ctx.fetcher.exchange()
    }

    pub fn market_type(&self) -> MarketType {
        self.ctx.fetcher.market_type()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start the fetcher's shared resources and the tick loop.
    pub async fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        self.ctx.fetcher.start(Arc::clone(&self.ctx.metrics)).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let symbols = self.config.symbols.clone();
        let interval = self.config.interval;
        let ctx = self.ctx.clone();
        self.task = Some(tokio::spawn(async move {
            tick_loop(ctx, symbols, interval, shutdown_rx).await;
        }));
        self.shutdown_tx = Some(shutdown_tx);
        info!(
            "[sched {}] started: {} symbols every {:?}, depth {}, timeout {:?}",
            self.label,
            self.config.symbols.len(),
            interval,
            self.config.depth,
            self.config.request_timeout
        );
    }

    /// Cancel the tick loop, then every in-flight fetch, then the fetcher.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.ctx.fetcher.stop().await;
        info!("[sched {}] stopped", self.label);
    }

    /// Point-in-time copy of every symbol's sync state, sorted by symbol.
    pub fn sync_states(&self) -> Vec<SymbolSyncState> {
        let mut out: Vec<_> = lock_states(&self.ctx.states).values().cloned().collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}

fn lock_states(states: &SyncStates) -> std::sync::MutexGuard<'_, AHashMap<String, SymbolSyncState>> {
    match states.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn tick_loop(ctx: FetchContext, symbols: Vec<String>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut in_flight: AHashMap<String, JoinHandle<()>> = AHashMap::new();
    let mut next_tick = Instant::now();
    let exchange = ctx.fetcher.exchange();
    let market_type = ctx.fetcher.market_type();

    loop {
        next_tick += interval;

        for symbol in &symbols {
            if in_flight.get(symbol).is_some_and(|h| !h.is_finished()) {
                debug!("[sched {}] {symbol} still in flight, skipping tick", ctx.label);
                ctx.metrics.inc_counter(
                    names::SNAPSHOT_SKIPPED_TICKS_TOTAL,
                    &[("exchange", exchange.as_str()), ("market_type", market_type.as_str()), ("symbol", symbol.as_str())],
                );
                if let Some(state) = lock_states(&ctx.states).get_mut(symbol) {
                    state.skipped_ticks += 1;
                }
                continue;
            }
            let handle = tokio::spawn(run_fetch(ctx.clone(), symbol.clone(), shutdown_rx.clone()));
            in_flight.insert(symbol.clone(), handle);
        }

        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            _ = shutdown_rx.changed() => break,
        }
        if *shutdown_rx.borrow() {
            break;
        }
    }

    // Fetch tasks observe the same shutdown signal and finish as cancelled.
    for (_, handle) in in_flight.drain() {
        let _ = handle.await;
    }
}

/// Per-fetch wrapper: timeout, cancellation, status accounting.
async fn run_fetch(ctx: FetchContext, symbol: String, mut shutdown_rx: watch::Receiver<bool>) {
    let exchange = ctx.fetcher.exchange();
    let market_type = ctx.fetcher.market_type();
    let started = Instant::now();

    let work = async {
        let fetch = ctx.fetcher.fetch_one(&symbol, ctx.depth, ctx.request_timeout);
        let raw = match tokio::time::timeout(ctx.request_timeout, fetch).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(FetchError::Timeout(ctx.request_timeout)),
        };
        normalize_and_publish(&*ctx.publisher, &ctx.metrics, exchange, market_type, &symbol, raw, ctx.depth).await
    };

    let outcome = if *shutdown_rx.borrow() {
        None
    } else {
        tokio::select! {
            r = work => Some(r),
            _ = shutdown_rx.changed() => None,
        }
    };

    let labels = [("exchange", exchange.as_str()), ("market_type", market_type.as_str()), ("symbol", symbol.as_str())];
    let (status, sequence_id) = match outcome {
        Some(Ok(snapshot)) => (FetchStatus::Success, snapshot.sequence_id),
        Some(Err(e)) => {
            let status = e.status();
            if status == FetchStatus::Timeout {
                ctx.metrics.inc_counter(names::SNAPSHOT_TIMEOUTS_TOTAL, &labels);
                warn!("[sched {}] {symbol} timed out: {e}", ctx.label);
            } else {
                warn!("[sched {}] {symbol} fetch failed: {e}", ctx.label);
            }
            (status, None)
        }
        None => {
            debug!("[sched {}] {symbol} cancelled", ctx.label);
            (FetchStatus::Cancelled, None)
        }
    };

    ctx.metrics.observe(names::SNAPSHOT_REQUEST_DURATION_SECONDS, &labels, started.elapsed().as_secs_f64());
    let status_labels = [
        ("exchange", exchange.as_str()),
        ("market_type", market_type.as_str()),
        ("symbol", symbol.as_str()),
        ("status", status.as_str()),
    ];
    ctx.metrics.inc_counter(names::SNAPSHOT_REQUESTS_TOTAL, &status_labels);

    if let Some(state) = lock_states(&ctx.states).get_mut(&symbol) {
        state.record(status, sequence_id, time_util::now_us());
    }
}
