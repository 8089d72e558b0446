//! Process supervisor: registry of workers, one monitor task each.

use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use bookfeed_core::config::SupervisorSettings;
use bookfeed_core::control::{MessageKind, create_control_message};
use bookfeed_core::types::ResourceLimits;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::error::SupervisorError;
use crate::event::{SupervisorEventReceiver, SupervisorEventSender};
use crate::launcher::WorkerLauncher;
use crate::monitor::{Command, WorkerMonitor};
use crate::resource::{ResourceSampler, SysinfoSampler};
use crate::worker::WorkerInfo;

struct WorkerEntry {
    commands: mpsc::UnboundedSender<Command>,
    info: watch::Receiver<WorkerInfo>,
    task: JoinHandle<()>,
}

struct Inner {
    settings: SupervisorSettings,
    sampler: Arc<dyn ResourceSampler>,
    workers: Mutex<AHashMap<String, WorkerEntry>>,
    /// Ids reserved by a `start` whose launch is still in progress.
    launching: std::sync::Mutex<AHashSet<String>>,
    events: SupervisorEventSender,
}

impl Inner {
    fn launching(&self) -> std::sync::MutexGuard<'_, AHashSet<String>> {
        match self.launching.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases a launch reservation however `start` ends.
struct Reservation<'a> {
    inner: &'a Inner,
    exchange_id: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.inner.launching().remove(self.exchange_id);
    }
}

/// Owns the lifecycle of one worker per exchange id.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, sampler: Arc<dyn ResourceSampler>) -> (Self, SupervisorEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            settings,
            sampler,
            workers: Mutex::new(AHashMap::new()),
            launching: std::sync::Mutex::new(AHashSet::new()),
            events,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Supervisor sampling real processes through `sysinfo`.
    pub fn with_sysinfo(settings: SupervisorSettings) -> (Self, SupervisorEventReceiver) {
        Self::new(settings, Arc::new(SysinfoSampler::new()))
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Launch a worker and its monitor task. `launcher` and `limits` are
    /// kept for every later restart.
    ///
    /// The id is reserved for the duration of the launch, so a concurrent
    /// `start` of the same id is rejected while other workers stay reachable.
    pub async fn start(
        &self,
        exchange_id: &str,
        launcher: Arc<dyn WorkerLauncher>,
        limits: ResourceLimits,
    ) -> Result<WorkerInfo, SupervisorError> {
        let _reservation = {
            let workers = self.inner.workers.lock().await;
            if workers.contains_key(exchange_id) || !self.inner.launching().insert(exchange_id.to_string()) {
                return Err(SupervisorError::AlreadyRunning(exchange_id.to_string()));
            }
            Reservation { inner: &self.inner, exchange_id }
        };

        // The registry stays unlocked while the process spawns.
        let launched = launcher.launch(exchange_id).await?;
        let (monitor, info) = WorkerMonitor::new(
            exchange_id,
            limits,
            launcher,
            self.inner.settings.clone(),
            Arc::clone(&self.inner.sampler),
            self.inner.events.clone(),
            launched,
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(monitor.run(command_rx));
        let snapshot = info.borrow().clone();

        self.inner.workers.lock().await.insert(exchange_id.to_string(), WorkerEntry { commands, info, task });
        info!("[sup {exchange_id}] started (pid={:?})", snapshot.pid);
        Ok(snapshot)
    }

    /// Stop a worker and drop it from the registry. Stopping an unknown or
    /// already stopped worker succeeds without doing anything.
    pub async fn stop(&self, exchange_id: &str, timeout: Duration) -> Result<(), SupervisorError> {
        let entry = self.inner.workers.lock().await.remove(exchange_id);
        let Some(entry) = entry else {
            debug!("[sup {exchange_id}] stop: not running");
            return Ok(());
        };

        let (reply, done) = oneshot::channel();
        if entry.commands.send(Command::Stop { timeout, reply }).is_ok() {
            let _ = done.await;
        }
        let _ = entry.task.await;
        Ok(())
    }

    /// Stop every worker concurrently with the configured stop timeout.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.inner.workers.lock().await.keys().cloned().collect();
        let timeout = self.inner.settings.stop_timeout();
        let mut set = JoinSet::new();
        for id in ids {
            let sup = self.clone();
            set.spawn(async move { sup.stop(&id, timeout).await });
        }
        while set.join_next().await.is_some() {}
    }

    /// Restart a worker now, counting against `max_restart_attempts`.
    pub async fn restart(&self, exchange_id: &str) -> Result<(), SupervisorError> {
        let (reply, done) = oneshot::channel();
        self.command(exchange_id, Command::Restart { reply }).await?;
        done.await.map_err(|_| SupervisorError::NotFound(exchange_id.to_string()))?
    }

    /// Send a `control_*` message to a worker.
    pub async fn send_control(&self, exchange_id: &str, kind: MessageKind, params: Value) -> Result<(), SupervisorError> {
        let msg = create_control_message(kind, exchange_id, params)?;
        let (reply, done) = oneshot::channel();
        self.command(exchange_id, Command::Send { msg, reply }).await?;
        done.await.map_err(|_| SupervisorError::ChannelClosed(exchange_id.to_string()))?
    }

    async fn command(&self, exchange_id: &str, cmd: Command) -> Result<(), SupervisorError> {
        let workers = self.inner.workers.lock().await;
        let entry = workers.get(exchange_id).ok_or_else(|| SupervisorError::NotFound(exchange_id.to_string()))?;
        entry.commands.send(cmd).map_err(|_| SupervisorError::NotFound(exchange_id.to_string()))
    }

    pub async fn worker_info(&self, exchange_id: &str) -> Option<WorkerInfo> {
        self.inner.workers.lock().await.get(exchange_id).map(|e| e.info.borrow().clone())
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let workers = self.inner.workers.lock().await;
        let mut all: Vec<WorkerInfo> = workers.values().map(|e| e.info.borrow().clone()).collect();
        all.sort_by(|a, b| a.exchange_id.cmp(&b.exchange_id));
        all
    }
}
