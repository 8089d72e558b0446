//! Worker runtime: the worker-process side of the control channel.
//!
//! Owns every scheduler of one exchange, reports `heartbeat`, `health` and
//! `metrics` to the supervisor, and obeys `control_stop`,
//! `control_restart` and `control_reload`.

use std::sync::Arc;

use anyhow::{Context, Result};
use bookfeed_core::config::AppConfig;
use bookfeed_core::control::{
    ControlChannel, ControlMessage, LogLevel, MessageKind, create_ack_message, create_health_message,
    create_heartbeat_message, create_log_message, create_metrics_message, decode_or_warn,
};
use bookfeed_core::metrics::MetricsRegistry;
use serde_json::{Map, Value, json};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::publish::SnapshotPublisher;
use crate::registry;
use crate::scheduler::SnapshotScheduler;

/// Re-reads configuration for `control_reload`.
pub type ReloadHook = Arc<dyn Fn() -> Result<AppConfig> + Send + Sync>;

/// How the runtime loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `control_stop` received.
    Stopped,
    /// The supervisor side of the channel went away.
    ChannelClosed,
}

impl WorkerExit {
    pub fn exit_code(&self) -> i32 {
        0
    }
}

pub struct WorkerRuntime {
    exchange_id: String,
    config: AppConfig,
    channel: ControlChannel,
    publisher: Arc<dyn SnapshotPublisher>,
    metrics: Arc<MetricsRegistry>,
    reload: Option<ReloadHook>,
    schedulers: Vec<SnapshotScheduler>,
    started_at: Instant,
}

impl WorkerRuntime {
    pub fn new(
        exchange_id: impl Into<String>,
        config: AppConfig,
        channel: ControlChannel,
        publisher: Arc<dyn SnapshotPublisher>,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            config,
            channel,
            publisher,
            metrics: Arc::new(MetricsRegistry::new()),
            reload: None,
            schedulers: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn with_reload_hook(mut self, hook: ReloadHook) -> Self {
        self.reload = Some(hook);
        self
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    fn build_schedulers(&self, config: &AppConfig) -> Result<Vec<SnapshotScheduler>> {
        let exchange = config
            .exchange(&self.exchange_id)
            .with_context(|| format!("exchange {} not in config", self.exchange_id))?;
        registry::create_schedulers(exchange, &config.snapshot, Arc::clone(&self.publisher), Arc::clone(&self.metrics))
    }

    async fn start_all(&mut self) {
        for s in &mut self.schedulers {
            s.start().await;
        }
    }

    async fn stop_all(&mut self) {
        for s in &mut self.schedulers {
            s.stop().await;
        }
    }

    /// Send a message, returning `false` once the supervisor is gone.
    fn send(&mut self, msg: ControlMessage) -> bool {
        match self.channel.send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!("[worker {}] send failed: {e}", self.exchange_id);
                false
            }
        }
    }

    fn log_to_supervisor(&mut self, level: LogLevel, message: &str) -> bool {
        let msg = create_log_message(&self.exchange_id, level, message);
        self.send(msg)
    }

    fn health_payload(&self) -> Value {
        let mut markets = Map::new();
        for s in &self.schedulers {
            markets.insert(
                s.market_type().as_str().to_string(),
                serde_json::to_value(s.sync_states()).unwrap_or(Value::Null),
            );
        }
        json!({
            "uptime_secs": self.started_at.elapsed().as_secs_f64(),
            "schedulers": self.schedulers.len(),
            "markets": markets,
        })
    }

    /// Build and start the schedulers, then serve the control channel until
    /// told to stop or the supervisor disappears.
    pub async fn run(mut self) -> Result<WorkerExit> {
        self.schedulers = self.build_schedulers(&self.config.clone())?;
        self.start_all().await;
        info!("[worker {}] running {} schedulers", self.exchange_id, self.schedulers.len());

        let settings = self.config.supervisor.clone();
        let heartbeat_every = settings.heartbeat_interval();
        let telemetry_every = settings.telemetry_interval();

        // First heartbeat goes out immediately so the supervisor sees RUNNING.
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut telemetry = tokio::time::interval_at(Instant::now() + telemetry_every, telemetry_every);
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let started = format!("worker started with {} schedulers", self.schedulers.len());
        if !self.log_to_supervisor(LogLevel::Info, &started) {
            self.stop_all().await;
            return Ok(WorkerExit::ChannelClosed);
        }

        let exit = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let msg = create_heartbeat_message(&self.exchange_id, self.started_at.elapsed().as_secs_f64());
                    if !self.send(msg) {
                        break WorkerExit::ChannelClosed;
                    }
                }

                _ = telemetry.tick() => {
                    let health = create_health_message(&self.exchange_id, self.health_payload());
                    let metrics = create_metrics_message(&self.exchange_id, self.metrics.snapshot_json());
                    if !self.send(health) || !self.send(metrics) {
                        break WorkerExit::ChannelClosed;
                    }
                }

                line = self.channel.recv_line() => {
                    let Some(line) = line else {
                        warn!("[worker {}] control channel closed", self.exchange_id);
                        break WorkerExit::ChannelClosed;
                    };
                    let Some(msg) = decode_or_warn(&line, &self.exchange_id) else { continue };
                    if let Some(exit) = self.handle(msg).await {
                        break exit;
                    }
                }
            }
        };

        self.stop_all().await;
        info!("[worker {}] exiting ({exit:?})", self.exchange_id);
        Ok(exit)
    }

    /// Handle one validated inbound message. Returns `Some` to end the loop.
    async fn handle(&mut self, msg: ControlMessage) -> Option<WorkerExit> {
        if msg.owner_id != self.exchange_id {
            warn!("[worker {}] dropping message addressed to {}", self.exchange_id, msg.owner_id);
            return None;
        }
        let Some(kind) = msg.message_kind() else {
            warn!("[worker {}] unknown message kind {:?}", self.exchange_id, msg.kind);
            return None;
        };

        match kind {
            MessageKind::ControlStop => {
                info!("[worker {}] stop requested", self.exchange_id);
                let ack = create_ack_message(&self.exchange_id, &msg);
                self.send(ack);
                Some(WorkerExit::Stopped)
            }
            MessageKind::ControlRestart => {
                info!("[worker {}] restarting schedulers", self.exchange_id);
                let ack = create_ack_message(&self.exchange_id, &msg);
                self.send(ack);
                self.stop_all().await;
                match self.build_schedulers(&self.config.clone()) {
                    Ok(schedulers) => self.schedulers = schedulers,
                    Err(e) => {
                        error!("[worker {}] rebuild failed: {e:#}", self.exchange_id);
                        self.log_to_supervisor(LogLevel::Error, &format!("restart failed: {e:#}"));
                    }
                }
                self.start_all().await;
                None
            }
            MessageKind::ControlReload => {
                let ack = create_ack_message(&self.exchange_id, &msg);
                self.send(ack);
                self.reload_config().await;
                None
            }
            other => {
                debug!("[worker {}] ignoring {other}", self.exchange_id);
                None
            }
        }
    }

    /// Re-read config and swap schedulers. On any failure the running
    /// schedulers stay untouched.
    async fn reload_config(&mut self) {
        let result = match &self.reload {
            Some(hook) => hook().and_then(|cfg| {
                cfg.validate()?;
                let schedulers = self.build_schedulers(&cfg)?;
                Ok((cfg, schedulers))
            }),
            None => Err(anyhow::anyhow!("no reload source configured")),
        };

        match result {
            Ok((cfg, schedulers)) => {
                self.stop_all().await;
                self.config = cfg;
                self.schedulers = schedulers;
                self.start_all().await;
                info!("[worker {}] config reloaded", self.exchange_id);
                self.log_to_supervisor(LogLevel::Info, "config reloaded");
            }
            Err(e) => {
                error!("[worker {}] reload failed: {e:#}", self.exchange_id);
                self.log_to_supervisor(LogLevel::Error, &format!("reload failed: {e:#}"));
            }
        }
    }
}
