//! Supervisor-side view of one worker.

use std::fmt;

use bookfeed_core::types::{ResourceLimits, ResourceUsage};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Launched, no heartbeat seen yet.
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Exited unexpectedly, failed to launch, or out of restart attempts.
    Failed,
    Restarting,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Restarting => "restarting",
        }
    }

    /// States in which a worker process is expected to be alive.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a worker record. The record itself is owned and mutated by
/// the worker's monitor task only; callers get clones of this.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub exchange_id: String,
    pub pid: Option<u32>,
    pub state: WorkerState,
    /// Launch time of the current process.
    pub start_time: Instant,
    /// Restarts over the lifetime of this record; never reset.
    pub restart_count: u32,
    /// Last heartbeat, or `None` if the current process has not sent one.
    pub last_heartbeat: Option<Instant>,
    pub limits: ResourceLimits,
    pub last_usage: Option<ResourceUsage>,
}

impl WorkerInfo {
    pub fn new(exchange_id: &str, limits: ResourceLimits) -> Self {
        Self {
            exchange_id: exchange_id.to_string(),
            pid: None,
            state: WorkerState::Starting,
            start_time: Instant::now(),
            restart_count: 0,
            last_heartbeat: None,
            limits,
            last_usage: None,
        }
    }

    /// Time since the last sign of life (heartbeat, or launch if none yet).
    pub fn silent_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_heartbeat.unwrap_or(self.start_time))
    }
}
