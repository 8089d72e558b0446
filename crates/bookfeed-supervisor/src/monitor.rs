//! Per-worker monitor task.
//!
//! One task per worker owns the worker's record, process handle, control
//! channel and resource monitor. Everything else talks to it through
//! [`Command`]s and observes it through a `watch` of [`WorkerInfo`].

use std::sync::Arc;
use std::time::Duration;

use bookfeed_core::config::SupervisorSettings;
use bookfeed_core::control::{ControlChannel, ControlMessage, MessageKind, create_control_message, decode_or_warn};
use bookfeed_core::types::ResourceLimits;
use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::event::{LimitLevel, SupervisorEvent, SupervisorEventSender};
use crate::launcher::{LaunchedWorker, WorkerExitStatus, WorkerHandle, WorkerLauncher};
use crate::resource::{LimitCheck, ResourceError, ResourceMonitor, ResourceSampler};
use crate::worker::{WorkerInfo, WorkerState};

pub(crate) enum Command {
    Stop {
        timeout: Duration,
        reply: oneshot::Sender<()>,
    },
    Restart {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Send {
        msg: ControlMessage,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
}

pub(crate) struct WorkerMonitor {
    info: WorkerInfo,
    info_tx: watch::Sender<WorkerInfo>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: SupervisorSettings,
    sampler: Arc<dyn ResourceSampler>,
    events: SupervisorEventSender,
    process: Option<Box<dyn WorkerHandle>>,
    channel: Option<ControlChannel>,
    resources: Option<ResourceMonitor>,
    heartbeat_alerted: bool,
    relaunch_at: Option<Instant>,
    exhausted: bool,
}

impl WorkerMonitor {
    pub(crate) fn new(
        exchange_id: &str,
        limits: ResourceLimits,
        launcher: Arc<dyn WorkerLauncher>,
        settings: SupervisorSettings,
        sampler: Arc<dyn ResourceSampler>,
        events: SupervisorEventSender,
        launched: LaunchedWorker,
    ) -> (Self, watch::Receiver<WorkerInfo>) {
        let info = WorkerInfo::new(exchange_id, limits);
        let (info_tx, info_rx) = watch::channel(info.clone());
        let mut monitor = Self {
            info,
            info_tx,
            launcher,
            settings,
            sampler,
            events,
            process: None,
            channel: None,
            resources: None,
            heartbeat_alerted: false,
            relaunch_at: None,
            exhausted: false,
        };
        monitor.attach(launched);
        (monitor, info_rx)
    }

    fn id(&self) -> &str {
        &self.info.exchange_id
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.info_tx.send_replace(self.info.clone());
    }

    fn set_state(&mut self, to: WorkerState) {
        let from = self.info.state;
        if from != to {
            self.info.state = to;
            debug!("[sup {}] {from} -> {to}", self.id());
            self.emit(SupervisorEvent::StateChanged { exchange_id: self.info.exchange_id.clone(), from, to });
        }
        self.publish();
    }

    /// Take ownership of a freshly launched worker.
    fn attach(&mut self, launched: LaunchedWorker) {
        let LaunchedWorker { pid, channel, handle } = launched;
        self.info.pid = pid;
        self.info.start_time = Instant::now();
        self.info.last_heartbeat = None;
        self.info.last_usage = None;
        self.heartbeat_alerted = false;
        self.process = Some(handle);
        self.channel = Some(channel);
        self.resources = pid.map(|pid| {
            let (soft_tx, hard_tx) = (self.events.clone(), self.events.clone());
            let (soft_id, hard_id) = (self.info.exchange_id.clone(), self.info.exchange_id.clone());
            let limits = self.info.limits;
            ResourceMonitor::new(pid, limits)
                .on_soft_limit(Box::new(move |usage| {
                    warn!(
                        "[sup {soft_id}] memory {:.1}MB above soft limit {}MB",
                        usage.memory_mb, limits.memory_soft_limit_mb
                    );
                    let _ = soft_tx.send(SupervisorEvent::ResourceLimit {
                        exchange_id: soft_id.clone(),
                        level: LimitLevel::Soft,
                        usage: *usage,
                    });
                }))
                .on_hard_limit(Box::new(move |usage| {
                    error!(
                        "[sup {hard_id}] memory {:.1}MB above hard limit {}MB",
                        usage.memory_mb, limits.memory_hard_limit_mb
                    );
                    let _ = hard_tx.send(SupervisorEvent::ResourceLimit {
                        exchange_id: hard_id.clone(),
                        level: LimitLevel::Hard,
                        usage: *usage,
                    });
                }))
        });
        info!("[sup {}] worker launched pid={:?}", self.id(), pid);
    }

    /// Drop the process handle, channel and resource monitor.
    fn release(&mut self) {
        self.process = None;
        self.channel = None;
        self.resources = None;
        self.info.pid = None;
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let every = self.settings.monitor_interval();
        let mut tick = tokio::time::interval_at(Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let relaunch_at = self.relaunch_at;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop { timeout, reply }) => {
                        self.stop(timeout).await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(Command::Restart { reply }) => {
                        let r = self.restart("requested").await;
                        let _ = reply.send(r);
                    }
                    Some(Command::Send { msg, reply }) => {
                        let _ = reply.send(self.send(msg));
                    }
                    None => {
                        let timeout = self.settings.stop_timeout();
                        self.stop(timeout).await;
                        return;
                    }
                },

                _ = tick.tick() => self.iteration().await,

                _ = tokio::time::sleep_until(relaunch_at.unwrap_or_else(Instant::now)), if relaunch_at.is_some() => {
                    self.relaunch().await;
                }
            }
        }
    }

    fn send(&mut self, msg: ControlMessage) -> Result<(), SupervisorError> {
        let id = self.info.exchange_id.clone();
        let closed = || SupervisorError::ChannelClosed(id.clone());
        match self.channel.as_mut() {
            Some(ch) => ch.send(msg).map_err(|_| closed()),
            None => Err(closed()),
        }
    }

    /// One monitor pass: exit check, drain inbound messages, heartbeat
    /// freshness, resource limits.
    async fn iteration(&mut self) {
        let Some(process) = self.process.as_mut() else {
            // A failed relaunch is retried until the restart bound is hit.
            if self.info.state == WorkerState::Failed && !self.exhausted && self.relaunch_at.is_none() {
                let _ = self.restart("relaunch failed").await;
            }
            return;
        };

        let status = process.try_wait().await;
        match status {
            Ok(Some(exit)) => {
                self.on_unexpected_exit(exit).await;
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("[sup {}] exit check failed: {e}", self.id()),
        }

        self.drain_channel();

        let silent = self.info.silent_for(Instant::now());
        if silent > self.settings.heartbeat_timeout() && !self.heartbeat_alerted {
            self.heartbeat_alerted = true;
            warn!("[sup {}] no heartbeat for {:.1}s", self.id(), silent.as_secs_f64());
            self.emit(SupervisorEvent::HeartbeatTimeout {
                exchange_id: self.info.exchange_id.clone(),
                silent_for: silent,
            });
            if self.settings.restart_on_heartbeat_timeout {
                let _ = self.restart("heartbeat timeout").await;
                return;
            }
        }

        if self.sample_resources() {
            let _ = self.restart("hard memory limit").await;
        }
    }

    /// Returns `true` when the hard memory limit was just crossed.
    fn sample_resources(&mut self) -> bool {
        let Some(res) = self.resources.as_mut() else { return false };
        let before = res.last_check();
        match res.poll(self.sampler.as_ref()) {
            Ok((usage, crossings)) => {
                let after = res.last_check();
                self.info.last_usage = Some(usage);
                self.publish();
                self.warn_new_excess(before, after);
                crossings.hard
            }
            Err(ResourceError::ProcessNotFound(pid)) => {
                debug!("[sup {}] pid {pid} gone before sampling", self.id());
                false
            }
        }
    }

    fn warn_new_excess(&self, before: LimitCheck, after: LimitCheck) {
        let Some(usage) = self.info.last_usage else { return };
        let limits = &self.info.limits;
        if after.cpu_exceeded && !before.cpu_exceeded {
            warn!("[sup {}] cpu {:.1}% above {}%", self.id(), usage.cpu_percent, limits.cpu_limit_percent);
        }
        if after.connections_exceeded && !before.connections_exceeded {
            warn!("[sup {}] {} connections above {}", self.id(), usage.connection_count, limits.max_connections);
        }
        if after.fds_exceeded && !before.fds_exceeded {
            warn!("[sup {}] {} fds above {}", self.id(), usage.fd_count, limits.max_file_descriptors);
        }
    }

    fn drain_channel(&mut self) {
        let Some(ch) = self.channel.as_mut() else { return };
        let mut lines = Vec::new();
        loop {
            match ch.try_recv_line() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("[sup {}] worker side of channel closed", self.info.exchange_id);
                    break;
                }
            }
        }
        for line in lines {
            if let Some(msg) = decode_or_warn(&line, &self.info.exchange_id) {
                self.dispatch(msg);
            }
        }
    }

    fn dispatch(&mut self, msg: ControlMessage) {
        if msg.owner_id != self.info.exchange_id {
            warn!("[sup {}] dropping message from {}", self.id(), msg.owner_id);
            return;
        }
        match msg.message_kind() {
            Some(MessageKind::Heartbeat) => {
                self.info.last_heartbeat = Some(Instant::now());
                if self.heartbeat_alerted {
                    info!("[sup {}] heartbeat resumed", self.id());
                    self.heartbeat_alerted = false;
                }
                if self.info.state == WorkerState::Starting {
                    self.set_state(WorkerState::Running);
                } else {
                    self.publish();
                }
            }
            Some(kind @ (MessageKind::Health | MessageKind::Metrics)) => {
                self.emit(SupervisorEvent::Telemetry {
                    exchange_id: self.info.exchange_id.clone(),
                    kind,
                    payload: msg.payload,
                });
            }
            Some(MessageKind::Log) => {
                let text = msg.payload.get("message").and_then(|v| v.as_str()).unwrap_or_default();
                match msg.payload.get("level").and_then(|v| v.as_str()) {
                    Some("error") => error!("[worker {}] {text}", self.id()),
                    Some("warn") => warn!("[worker {}] {text}", self.id()),
                    Some("debug") => debug!("[worker {}] {text}", self.id()),
                    _ => info!("[worker {}] {text}", self.id()),
                }
                self.emit(SupervisorEvent::Telemetry {
                    exchange_id: self.info.exchange_id.clone(),
                    kind: MessageKind::Log,
                    payload: msg.payload,
                });
            }
            Some(MessageKind::Ack) => {
                debug!("[sup {}] ack {}", self.id(), msg.payload);
            }
            Some(other) => warn!("[sup {}] unexpected {other} from worker, dropped", self.id()),
            None => warn!("[sup {}] unknown message kind {:?}, dropped", self.id(), msg.kind),
        }
    }

    async fn on_unexpected_exit(&mut self, exit: WorkerExitStatus) {
        warn!("[sup {}] worker exited unexpectedly ({exit})", self.id());
        self.emit(SupervisorEvent::WorkerExited { exchange_id: self.info.exchange_id.clone(), code: exit.code });
        self.release();
        self.set_state(WorkerState::Failed);
        let _ = self.restart("worker exited").await;
    }

    /// Stop the current process and schedule a relaunch after the cooldown,
    /// or give up once the restart bound is reached. A restart requested
    /// while a relaunch is already scheduled joins that relaunch.
    async fn restart(&mut self, reason: &str) -> Result<(), SupervisorError> {
        if self.relaunch_at.is_some() {
            debug!("[sup {}] {reason}: relaunch already scheduled", self.id());
            return Ok(());
        }
        let max = self.settings.max_restart_attempts;
        if self.info.restart_count >= max {
            if self.process.is_some() {
                self.shutdown_process(self.settings.stop_timeout()).await;
            }
            self.relaunch_at = None;
            if !self.exhausted {
                self.exhausted = true;
                error!("[sup {}] {reason}: restart limit {max} reached, giving up", self.id());
                self.emit(SupervisorEvent::RestartsExhausted {
                    exchange_id: self.info.exchange_id.clone(),
                    attempts: self.info.restart_count,
                });
            }
            self.set_state(WorkerState::Failed);
            return Err(SupervisorError::RestartLimit(self.info.exchange_id.clone()));
        }

        self.set_state(WorkerState::Restarting);
        if self.process.is_some() {
            self.shutdown_process(self.settings.stop_timeout()).await;
        }
        self.info.restart_count += 1;
        let attempt = self.info.restart_count;
        let cooldown = self.settings.restart_cooldown();
        info!(
            "[sup {}] {reason}: restart {attempt}/{max} in {:.1}s",
            self.id(),
            cooldown.as_secs_f64()
        );
        self.emit(SupervisorEvent::RestartAttempt { exchange_id: self.info.exchange_id.clone(), attempt });
        self.relaunch_at = Some(Instant::now() + cooldown);
        self.publish();
        Ok(())
    }

    async fn relaunch(&mut self) {
        self.relaunch_at = None;
        let id = self.info.exchange_id.clone();
        match self.launcher.launch(&id).await {
            Ok(launched) => {
                self.attach(launched);
                self.set_state(WorkerState::Starting);
            }
            Err(e) => {
                error!("[sup {id}] relaunch failed: {e}");
                self.emit(SupervisorEvent::LaunchFailed { exchange_id: id, error: e.to_string() });
                self.set_state(WorkerState::Failed);
            }
        }
    }

    /// `control_stop`, then SIGTERM after `timeout`, then kill after
    /// `kill_grace`.
    async fn shutdown_process(&mut self, timeout: Duration) {
        let Some(mut process) = self.process.take() else { return };
        let id = self.info.exchange_id.clone();

        if let Some(ch) = self.channel.as_mut() {
            if let Ok(msg) = create_control_message(MessageKind::ControlStop, &id, json!({ "reason": "supervisor" })) {
                let _ = ch.send(msg);
            }
        }

        let grace = self.settings.kill_grace();
        match tokio::time::timeout(timeout, process.wait()).await {
            Ok(Ok(exit)) => debug!("[sup {id}] worker stopped ({exit})"),
            Ok(Err(e)) => warn!("[sup {id}] wait failed: {e}"),
            Err(_) => {
                warn!("[sup {id}] no exit within {:.1}s, terminating", timeout.as_secs_f64());
                process.terminate();
                if tokio::time::timeout(grace, process.wait()).await.is_err() {
                    warn!("[sup {id}] still alive after terminate, killing");
                    process.kill();
                    let _ = tokio::time::timeout(grace, process.wait()).await;
                }
            }
        }
        self.release();
    }

    async fn stop(&mut self, timeout: Duration) {
        self.relaunch_at = None;
        if self.process.is_some() {
            self.set_state(WorkerState::Stopping);
            self.shutdown_process(timeout).await;
        }
        self.release();
        self.set_state(WorkerState::Stopped);
        info!("[sup {}] worker stopped", self.id());
    }
}
