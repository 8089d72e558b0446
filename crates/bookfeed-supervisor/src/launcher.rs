//! Worker launchers.
//!
//! A launcher is the retained entry point of a worker: the supervisor calls
//! it once on start and again on every restart, always with the same
//! parameters.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bookfeed_core::control::ControlChannel;
use tokio::process::{Child, Command};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::error::SupervisorError;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExitStatus {
    pub code: Option<i32>,
    /// Terminating signal (unix processes only).
    pub signal: Option<i32>,
}

impl WorkerExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("aborted"),
        }
    }
}

impl From<std::process::ExitStatus> for WorkerExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self { code: status.code(), signal }
    }
}

/// Handle to a running worker, owned by its monitor task.
#[async_trait]
pub trait WorkerHandle: Send + 'static {
    /// Non-blocking exit check.
    async fn try_wait(&mut self) -> Result<Option<WorkerExitStatus>, SupervisorError>;

    async fn wait(&mut self) -> Result<WorkerExitStatus, SupervisorError>;

    /// Ask the worker to terminate (SIGTERM for processes).
    fn terminate(&mut self);

    /// Unconditional kill.
    fn kill(&mut self);
}

/// A freshly launched worker: its PID if it has one, the supervisor end of
/// its control channel, and the handle used to reap it.
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub channel: ControlChannel,
    pub handle: Box<dyn WorkerHandle>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, exchange_id: &str) -> Result<LaunchedWorker, SupervisorError>;
}

// ---------------------------------------------------------------------------
// OS child process
// ---------------------------------------------------------------------------

/// Spawns the worker as a child process. The control channel runs over the
/// child's stdin/stdout; stderr is inherited for logs.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), envs: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, exchange_id: &str) -> Result<LaunchedWorker, SupervisorError> {
        let launch_err = |reason: String| SupervisorError::Launch { exchange_id: exchange_id.to_string(), reason };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_err(format!("{}: {e}", self.program.display())))?;

        let stdin = child.stdin.take().ok_or_else(|| launch_err("stdin not piped".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| launch_err("stdout not piped".into()))?;
        let pid = child.id();
        debug!("[sup {exchange_id}] spawned {} pid={pid:?}", self.program.display());

        let (channel, pumps) = ControlChannel::bridge(stdout, stdin, exchange_id);
        Ok(LaunchedWorker {
            pid,
            channel,
            handle: Box::new(ChildHandle { child, pid, pumps, exit: None }),
        })
    }
}

struct ChildHandle {
    child: Child,
    pid: Option<u32>,
    pumps: [JoinHandle<()>; 2],
    exit: Option<WorkerExitStatus>,
}

#[async_trait]
impl WorkerHandle for ChildHandle {
    async fn try_wait(&mut self) -> Result<Option<WorkerExitStatus>, SupervisorError> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(WorkerExitStatus::from);
        }
        Ok(self.exit)
    }

    async fn wait(&mut self) -> Result<WorkerExitStatus, SupervisorError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = WorkerExitStatus::from(self.child.wait().await?);
        self.exit = Some(exit);
        Ok(exit)
    }

    fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("SIGTERM to pid {pid} failed: {e}");
            }
            return;
        }
        self.kill();
    }

    fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            warn!("kill of pid {:?} failed: {e}", self.pid);
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// In-process task
// ---------------------------------------------------------------------------

type WorkerEntry = Arc<dyn Fn(String, ControlChannel) -> Pin<Box<dyn Future<Output = i32> + Send>> + Send + Sync>;

/// Runs the worker as a tokio task over an in-memory channel pair. The
/// future's output is the worker's exit code.
#[derive(Clone)]
pub struct InProcessLauncher {
    entry: WorkerEntry,
    pid: Option<u32>,
}

impl InProcessLauncher {
    pub fn new<F, Fut>(entry: F) -> Self
    where
        F: Fn(String, ControlChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = i32> + Send + 'static,
    {
        let entry: WorkerEntry = Arc::new(
            move |id: String, ch: ControlChannel| -> Pin<Box<dyn Future<Output = i32> + Send>> {
                Box::pin(entry(id, ch))
            },
        );
        Self { entry, pid: None }
    }

    /// Report `pid` for resource monitoring (usually this process's own).
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, exchange_id: &str) -> Result<LaunchedWorker, SupervisorError> {
        let (supervisor_end, worker_end) = ControlChannel::pair();
        let join = tokio::spawn((self.entry)(exchange_id.to_string(), worker_end));
        Ok(LaunchedWorker {
            pid: self.pid,
            channel: supervisor_end,
            handle: Box::new(TaskHandle { join, exit: None }),
        })
    }
}

struct TaskHandle {
    join: JoinHandle<i32>,
    exit: Option<WorkerExitStatus>,
}

fn task_exit(result: Result<i32, JoinError>) -> WorkerExitStatus {
    match result {
        Ok(code) => WorkerExitStatus { code: Some(code), signal: None },
        Err(e) if e.is_panic() => WorkerExitStatus { code: Some(101), signal: None },
        Err(_) => WorkerExitStatus { code: None, signal: None },
    }
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    async fn try_wait(&mut self) -> Result<Option<WorkerExitStatus>, SupervisorError> {
        if self.exit.is_none() && self.join.is_finished() {
            self.exit = Some(task_exit((&mut self.join).await));
        }
        Ok(self.exit)
    }

    async fn wait(&mut self) -> Result<WorkerExitStatus, SupervisorError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = task_exit((&mut self.join).await);
        self.exit = Some(exit);
        Ok(exit)
    }

    fn terminate(&mut self) {
        self.join.abort();
    }

    fn kill(&mut self) {
        self.join.abort();
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookfeed_core::control::{ControlMessage, MessageKind, create_control_message};
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn in_process_worker_reports_exit_code() {
        let launcher = InProcessLauncher::new(|id, mut ch| async move {
            let line = ch.recv_line().await.unwrap_or_default();
            let msg = ControlMessage::decode(&line).unwrap();
            assert_eq!(msg.owner_id, id);
            7
        })
        .with_pid(99);

        let mut w = launcher.launch("bybit").await.unwrap();
        assert_eq!(w.pid, Some(99));
        assert_eq!(w.handle.try_wait().await.unwrap(), None);

        w.channel
            .send(create_control_message(MessageKind::ControlStop, "bybit", Value::Null).unwrap())
            .unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), w.handle.wait()).await.unwrap().unwrap();
        assert_eq!(exit.code, Some(7));
        assert_eq!(w.handle.try_wait().await.unwrap(), Some(exit));
    }

    #[tokio::test]
    async fn aborted_task_has_no_code() {
        let launcher = InProcessLauncher::new(|_, _ch| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            0
        });
        let mut w = launcher.launch("okx").await.unwrap();
        w.handle.kill();
        let exit = w.handle.wait().await.unwrap();
        assert_eq!(exit, WorkerExitStatus { code: None, signal: None });
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_process_talks_over_stdio() {
        let launcher = ProcessLauncher::new("sh").args(["-c", "read line; echo \"$line\"; exit 3"]);
        let mut w = launcher.launch("binance").await.unwrap();
        assert!(w.pid.is_some());

        let msg = create_control_message(MessageKind::ControlReload, "binance", Value::Null).unwrap();
        w.channel.send(msg).unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), w.channel.recv_line()).await.unwrap().unwrap();
        let echoed = ControlMessage::decode(&echoed).unwrap();
        assert_eq!(echoed.message_kind(), Some(MessageKind::ControlReload));
        assert_eq!(echoed.seq, Some(1));

        let exit = tokio::time::timeout(Duration::from_secs(5), w.handle.wait()).await.unwrap().unwrap();
        assert_eq!(exit.code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_ends_child() {
        let launcher = ProcessLauncher::new("sleep").arg("30");
        let mut w = launcher.launch("deribit").await.unwrap();
        w.handle.terminate();
        let exit = tokio::time::timeout(Duration::from_secs(5), w.handle.wait()).await.unwrap().unwrap();
        assert_eq!(exit.signal, Some(15));
        assert_eq!(exit.to_string(), "signal 15");
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let launcher = ProcessLauncher::new("/nonexistent/bookfeed-worker");
        assert!(matches!(launcher.launch("okx").await, Err(SupervisorError::Launch { .. })));
    }
}
