//! # bookfeed-supervisor
//!
//! Process supervision layer: one isolated worker per exchange, a control
//! channel to each, resource ceilings, and bounded automatic restarts.
//!
//! ## Worker lifecycle
//!
//! ```text
//! STARTING --heartbeat--> RUNNING --stop--> STOPPING --> STOPPED
//!     |                      |
//!     +-------exit/hard limit+--> FAILED --restart--> RESTARTING --> STARTING
//!                                   ^                                   |
//!                                   +---- restarts exhausted -----------+
//! ```
//!
//! Workers are launched through a [`WorkerLauncher`]: an OS child process
//! talking over stdin/stdout ([`ProcessLauncher`]) or a tokio task with an
//! in-memory channel ([`InProcessLauncher`]).

pub mod error;
pub mod event;
pub mod launcher;
mod monitor;
pub mod resource;
pub mod supervisor;
pub mod worker;

pub use error::SupervisorError;
pub use event::{LimitLevel, SupervisorEvent, SupervisorEventReceiver, SupervisorEventSender};
pub use launcher::{InProcessLauncher, LaunchedWorker, ProcessLauncher, WorkerExitStatus, WorkerHandle, WorkerLauncher};
pub use resource::{LimitCheck, ResourceError, ResourceMonitor, ResourceSampler, SysinfoSampler};
pub use supervisor::ProcessSupervisor;
pub use worker::{WorkerInfo, WorkerState};
