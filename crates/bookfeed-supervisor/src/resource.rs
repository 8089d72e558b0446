//! Resource monitor: samples one process and reports limit crossings.
//!
//! Memory callbacks are edge-triggered. A callback fires on the sample that
//! first crosses its threshold and not again until usage has dropped back
//! under it.

use std::sync::Mutex;

use bookfeed_core::time_util;
use bookfeed_core::types::{ResourceLimits, ResourceUsage};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("process {0} not found")]
    ProcessNotFound(u32),
}

/// Source of resource samples for a PID.
pub trait ResourceSampler: Send + Sync + 'static {
    fn sample(&self, pid: u32) -> Result<ResourceUsage, ResourceError>;
}

/// Samples CPU and RSS through `sysinfo`; file descriptors and sockets from
/// `/proc/<pid>/fd` on Linux (zero elsewhere).
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self { system: Mutex::new(System::new()) }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self, pid: u32) -> Result<ResourceUsage, ResourceError> {
        let mut sys = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let spid = Pid::from_u32(pid);
        if !sys.refresh_process(spid) {
            return Err(ResourceError::ProcessNotFound(pid));
        }
        sys.refresh_memory();
        let total = sys.total_memory();
        let process = sys.process(spid).ok_or(ResourceError::ProcessNotFound(pid))?;

        let rss = process.memory();
        let (fd_count, connection_count) = count_fds(pid);
        Ok(ResourceUsage {
            cpu_percent: process.cpu_usage() as f64,
            memory_mb: rss as f64 / (1024.0 * 1024.0),
            memory_percent: if total > 0 { rss as f64 * 100.0 / total as f64 } else { 0.0 },
            connection_count,
            fd_count,
            sampled_at_us: time_util::now_us(),
        })
    }
}

/// `(open fds, of which sockets)`.
#[cfg(target_os = "linux")]
fn count_fds(pid: u32) -> (u32, u32) {
    let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
        return (0, 0);
    };
    let mut fds = 0;
    let mut sockets = 0;
    for entry in entries.flatten() {
        fds += 1;
        let is_socket = std::fs::read_link(entry.path())
            .map(|target| target.to_string_lossy().starts_with("socket:"))
            .unwrap_or(false);
        if is_socket {
            sockets += 1;
        }
    }
    (fds, sockets)
}

#[cfg(not(target_os = "linux"))]
fn count_fds(_pid: u32) -> (u32, u32) {
    (0, 0)
}

/// Result of comparing one sample against limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitCheck {
    pub memory_soft_exceeded: bool,
    pub memory_hard_exceeded: bool,
    pub cpu_exceeded: bool,
    pub connections_exceeded: bool,
    pub fds_exceeded: bool,
}

impl LimitCheck {
    pub fn any(&self) -> bool {
        self.memory_soft_exceeded
            || self.memory_hard_exceeded
            || self.cpu_exceeded
            || self.connections_exceeded
            || self.fds_exceeded
    }
}

pub fn check(usage: &ResourceUsage, limits: &ResourceLimits) -> LimitCheck {
    LimitCheck {
        memory_soft_exceeded: usage.memory_mb > limits.memory_soft_limit_mb as f64,
        memory_hard_exceeded: usage.memory_mb > limits.memory_hard_limit_mb as f64,
        cpu_exceeded: usage.cpu_percent > limits.cpu_limit_percent,
        connections_exceeded: usage.connection_count > limits.max_connections,
        fds_exceeded: usage.fd_count > limits.max_file_descriptors,
    }
}

pub type LimitCallback = Box<dyn Fn(&ResourceUsage) + Send + Sync>;

/// Memory thresholds crossed by one observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crossings {
    pub soft: bool,
    pub hard: bool,
}

/// Monitor bound to one PID.
pub struct ResourceMonitor {
    pid: u32,
    limits: ResourceLimits,
    soft_triggered: bool,
    hard_triggered: bool,
    on_soft: Option<LimitCallback>,
    on_hard: Option<LimitCallback>,
    last_usage: Option<ResourceUsage>,
    last_check: LimitCheck,
}

impl ResourceMonitor {
    pub fn new(pid: u32, limits: ResourceLimits) -> Self {
        Self {
            pid,
            limits,
            soft_triggered: false,
            hard_triggered: false,
            on_soft: None,
            on_hard: None,
            last_usage: None,
            last_check: LimitCheck::default(),
        }
    }

    pub fn on_soft_limit(mut self, cb: LimitCallback) -> Self {
        self.on_soft = Some(cb);
        self
    }

    pub fn on_hard_limit(mut self, cb: LimitCallback) -> Self {
        self.on_hard = Some(cb);
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn last_usage(&self) -> Option<ResourceUsage> {
        self.last_usage
    }

    pub fn last_check(&self) -> LimitCheck {
        self.last_check
    }

    /// Sample the bound PID and feed the result to [`observe`](Self::observe).
    pub fn poll(&mut self, sampler: &dyn ResourceSampler) -> Result<(ResourceUsage, Crossings), ResourceError> {
        let usage = sampler.sample(self.pid)?;
        Ok((usage, self.observe(usage)))
    }

    /// Record one sample, firing callbacks on upward crossings only.
    pub fn observe(&mut self, usage: ResourceUsage) -> Crossings {
        let result = check(&usage, &self.limits);
        let mut crossings = Crossings::default();

        if result.memory_soft_exceeded {
            if !self.soft_triggered {
                self.soft_triggered = true;
                crossings.soft = true;
                if let Some(cb) = &self.on_soft {
                    cb(&usage);
                }
            }
        } else {
            self.soft_triggered = false;
        }

        if result.memory_hard_exceeded {
            if !self.hard_triggered {
                self.hard_triggered = true;
                crossings.hard = true;
                if let Some(cb) = &self.on_hard {
                    cb(&usage);
                }
            }
        } else {
            self.hard_triggered = false;
        }

        self.last_usage = Some(usage);
        self.last_check = result;
        crossings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn mem(mb: f64) -> ResourceUsage {
        ResourceUsage { memory_mb: mb, ..Default::default() }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            memory_soft_limit_mb: 100,
            memory_hard_limit_mb: 200,
            cpu_limit_percent: 50.0,
            max_connections: 4,
            max_file_descriptors: 32,
        }
    }

    #[test]
    fn soft_callback_is_edge_triggered() {
        let fired = Arc::new(AtomicU32::new(0));
        let on_which = Arc::new(Mutex::new(Vec::new()));
        let (f, w) = (fired.clone(), on_which.clone());
        let mut monitor = ResourceMonitor::new(1, limits()).on_soft_limit(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        for (i, mb) in [50.0, 150.0, 150.0, 150.0, 50.0, 150.0].into_iter().enumerate() {
            if monitor.observe(mem(mb)).soft {
                w.lock().unwrap().push(i + 1);
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(*on_which.lock().unwrap(), vec![2, 6]);
    }

    #[test]
    fn hard_crossing_also_reports_soft() {
        let hard = Arc::new(AtomicU32::new(0));
        let h = hard.clone();
        let mut monitor = ResourceMonitor::new(1, limits()).on_hard_limit(Box::new(move |u| {
            assert!(u.memory_mb > 200.0);
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(monitor.observe(mem(250.0)), Crossings { soft: true, hard: true });
        assert_eq!(monitor.observe(mem(180.0)), Crossings::default());
        assert_eq!(monitor.observe(mem(250.0)), Crossings { soft: false, hard: true });
        assert_eq!(hard.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn check_flags_every_dimension() {
        let usage = ResourceUsage {
            cpu_percent: 75.0,
            memory_mb: 10.0,
            connection_count: 5,
            fd_count: 33,
            ..Default::default()
        };
        let c = check(&usage, &limits());
        assert!(c.cpu_exceeded && c.connections_exceeded && c.fds_exceeded);
        assert!(!c.memory_soft_exceeded && !c.memory_hard_exceeded);
        assert!(c.any());
        assert!(!check(&mem(1.0), &limits()).any());
    }

    #[test]
    fn sampling_self_and_missing_pid() {
        let sampler = SysinfoSampler::new();
        let me = sampler.sample(std::process::id()).unwrap();
        assert!(me.memory_mb > 0.0);
        #[cfg(target_os = "linux")]
        assert!(me.fd_count > 0);

        assert!(matches!(sampler.sample(u32::MAX - 1), Err(ResourceError::ProcessNotFound(_))));
    }
}
