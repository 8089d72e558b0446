//! Events emitted by the supervisor to whoever aggregates telemetry.
//!
//! The owner of the [`ProcessSupervisor`](crate::ProcessSupervisor) polls a
//! [`SupervisorEventReceiver`] for lifecycle changes, restart decisions,
//! limit crossings and the telemetry workers report.

use std::time::Duration;

use bookfeed_core::control::MessageKind;
use bookfeed_core::types::ResourceUsage;
use serde_json::Value;

use crate::worker::WorkerState;

/// Which memory threshold was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitLevel {
    Soft,
    Hard,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged {
        exchange_id: String,
        from: WorkerState,
        to: WorkerState,
    },

    /// The worker process ended without being asked to.
    WorkerExited {
        exchange_id: String,
        code: Option<i32>,
    },

    RestartAttempt {
        exchange_id: String,
        attempt: u32,
    },

    /// `max_restart_attempts` reached; the worker stays FAILED.
    RestartsExhausted {
        exchange_id: String,
        attempts: u32,
    },

    LaunchFailed {
        exchange_id: String,
        error: String,
    },

    /// No heartbeat for longer than `heartbeat_timeout`. Emitted once per stall.
    HeartbeatTimeout {
        exchange_id: String,
        silent_for: Duration,
    },

    ResourceLimit {
        exchange_id: String,
        level: LimitLevel,
        usage: ResourceUsage,
    },

    /// `health`, `metrics` or `log` payload forwarded from a worker.
    Telemetry {
        exchange_id: String,
        kind: MessageKind,
        payload: Value,
    },
}

impl SupervisorEvent {
    pub fn exchange_id(&self) -> &str {
        match self {
            Self::StateChanged { exchange_id, .. }
            | Self::WorkerExited { exchange_id, .. }
            | Self::RestartAttempt { exchange_id, .. }
            | Self::RestartsExhausted { exchange_id, .. }
            | Self::LaunchFailed { exchange_id, .. }
            | Self::HeartbeatTimeout { exchange_id, .. }
            | Self::ResourceLimit { exchange_id, .. }
            | Self::Telemetry { exchange_id, .. } => exchange_id,
        }
    }
}

pub type SupervisorEventSender = tokio::sync::mpsc::UnboundedSender<SupervisorEvent>;

pub type SupervisorEventReceiver = tokio::sync::mpsc::UnboundedReceiver<SupervisorEvent>;
