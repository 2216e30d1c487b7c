//! Process-backed tasks
//!
//! A [`ProcessTask`] launches an OS process, wires its output through a pipe
//! or pseudo-terminal and turns its exit status into a returncode:
//!
//! - normal exit: the exit code
//! - death by signal: `-signal`
//! - cancellation: SIGTERM to the process group, SIGKILL after the cancel
//!   window; a process that survives even that is reported as an orphan
//!
//! How the process is created is delegated to a [`Launcher`]. The
//! [`CommandLauncher`] executes a program; `ForkLauncher` in
//! [`crate::fork`] runs an in-process entry point in a child process.

mod command;
mod output;

pub use command::CommandLauncher;
pub(crate) use command::{
    install_descriptors, join_cgroup, open_cgroup_procs, park_descriptors,
};

use crate::task::{CANCELLED_RETURNCODE, CancelSignal, EX_SOFTWARE, ReturnCode, Task, TaskHandle};
use async_trait::async_trait;
use futures::future::BoxFuture;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use output::{OutputPump, open_output};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default time between SIGTERM and SIGKILL when cancelling
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Time the output pump may keep draining after the process is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Child descriptor number to the descriptor it should receive
pub type FdMap = BTreeMap<i32, OwnedFd>;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Empty command line for '{0}'")]
    EmptyCommand(String),

    #[error("Fork error: {0}")]
    Fork(#[from] crate::fork::ForkError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub type ProcessResult<T> = Result<T, ProcessError>;

impl ProcessError {
    /// Returncode reported for a process that could not be started
    pub fn returncode(&self) -> ReturnCode {
        match self {
            ProcessError::Spawn { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => 127,
                io::ErrorKind::PermissionDenied => 126,
                _ => 1,
            },
            _ => 1,
        }
    }
}

/// Exit status of a reaped process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ProcessExit {
    Exited(i32),
    Signaled(i32),
}

impl ProcessExit {
    /// Task returncode: the exit code, or `-signal`
    pub fn returncode(&self) -> ReturnCode {
        match *self {
            ProcessExit::Exited(code) => code,
            ProcessExit::Signaled(signal) => -signal,
        }
    }

    /// Shell-style exit code: `128 + signal` for signal death
    pub fn cli_exit_code(&self) -> i32 {
        match *self {
            ProcessExit::Exited(code) => code,
            ProcessExit::Signaled(signal) => 128 + signal,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match *self {
            ProcessExit::Signaled(signal) => Some(signal),
            ProcessExit::Exited(_) => None,
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessExit::Exited(code),
            (None, Some(signal)) => ProcessExit::Signaled(signal),
            (None, None) => ProcessExit::Exited(EX_SOFTWARE),
        }
    }
}

/// Where the child's stdout and stderr go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Pty for foreground processes attached to a terminal, else a pipe
    #[default]
    Auto,
    Pipe,
    Pty,
}

/// Configuration shared by every launcher
#[derive(Debug)]
pub struct ProcessSpec {
    /// Name used in logs and as the task name
    pub name: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting ours
    pub env_clear: bool,
    /// Background processes are not echoed and get a null stdin
    pub background: bool,
    /// Output is appended here when set
    pub log_path: Option<PathBuf>,
    pub output: OutputMode,
    /// Extra descriptors for the child; entries for 0-2 override stdio
    pub fd_map: FdMap,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub umask: Option<u32>,
    /// SIGTERM to SIGKILL escalation window
    pub cancel_timeout: Duration,
    /// Force a null stdin even in the foreground
    pub stdin_null: bool,
    /// `cgroup.procs` file the child writes its own pid to before exec
    pub cgroup_procs: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cwd: None,
            env: BTreeMap::new(),
            env_clear: false,
            background: false,
            log_path: None,
            output: OutputMode::Auto,
            fd_map: FdMap::new(),
            uid: None,
            gid: None,
            umask: None,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            stdin_null: false,
            cgroup_procs: None,
        }
    }
}

/// A freshly created child and the future that reaps it
pub struct SpawnedChild {
    pub pid: Pid,
    pub exit: BoxFuture<'static, io::Result<ProcessExit>>,
}

/// Creates the OS process for a [`ProcessTask`]
pub trait Launcher: Send + 'static {
    /// Short description for logs, usually the program name
    fn describe(&self) -> String;

    /// Create the child with the given descriptors installed.
    ///
    /// `fds` always contains entries for 0, 1 and 2 except when stdin is
    /// inherited, in which case 0 is absent.
    fn launch(&mut self, spec: &ProcessSpec, fds: FdMap) -> ProcessResult<SpawnedChild>;
}

/// How a terminated process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ProcessExit),
    /// Still alive after SIGKILL; reaped in the background
    Orphaned,
}

/// A launched process being supervised
pub struct RunningProcess {
    name: String,
    pid: Pid,
    exit: Option<BoxFuture<'static, io::Result<ProcessExit>>>,
    status: Option<ProcessExit>,
    pump: Option<OutputPump>,
    pty: bool,
}

impl std::fmt::Debug for RunningProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("pty", &self.pty)
            .finish()
    }
}

impl RunningProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether output goes through a pseudo-terminal
    pub fn pty_used(&self) -> bool {
        self.pty
    }

    /// Exit status if the process has been reaped
    pub fn status(&self) -> Option<ProcessExit> {
        self.status
    }

    /// Wait for the process to exit.
    ///
    /// Cancel safe: dropping the returned future keeps the child reapable.
    pub async fn wait(&mut self) -> io::Result<ProcessExit> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let exit = match self.exit.as_mut() {
            Some(exit) => exit,
            None => return Err(io::Error::other("process was detached")),
        };
        let status = exit.await?;
        self.exit = None;
        self.status = Some(status);
        debug!("Process '{}' ({}) exited: {:?}", self.name, self.pid, status);

        if let Some(pump) = self.pump.take() {
            pump.finish(OUTPUT_DRAIN_TIMEOUT).await;
        }
        Ok(status)
    }

    /// Send a signal to the process group, falling back to the process
    pub fn signal(&self, signal: Signal) {
        if self.status.is_some() || self.exit.is_none() {
            return;
        }
        if killpg(self.pid, signal).is_err() {
            if let Err(e) = kill(self.pid, signal) {
                debug!("Failed to send {} to {}: {}", signal, self.pid, e);
            }
        }
    }

    /// SIGTERM, then SIGKILL after `grace`, then give up after another
    /// `grace` and leave the child to a background reaper.
    pub async fn terminate(&mut self, grace: Duration) -> Termination {
        if let Some(status) = self.status {
            return Termination::Exited(status);
        }

        self.signal(Signal::SIGTERM);
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.wait()).await {
            return Termination::Exited(status);
        }

        warn!(
            pid = %self.pid,
            "Process '{}' did not exit after SIGTERM, sending SIGKILL", self.name
        );
        self.signal(Signal::SIGKILL);
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.wait()).await {
            return Termination::Exited(status);
        }

        warn!(
            pid = %self.pid,
            "Orphan process '{}' survived SIGKILL, reaping in the background", self.name
        );
        self.detach();
        Termination::Orphaned
    }

    /// Stop supervising; a background task still reaps the child
    pub fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(exit) = self.exit.take() {
            let pid = self.pid;
            tokio::spawn(async move {
                if let Ok(status) = exit.await {
                    debug!("Reaped detached process {}: {:?}", pid, status);
                }
            });
        }
    }
}

/// A task backed by an OS process
pub struct ProcessTask<L: Launcher> {
    spec: ProcessSpec,
    launcher: L,
}

impl ProcessTask<CommandLauncher> {
    /// Task running `args[0]` with the remaining arguments
    pub fn command<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ProcessSpec::new(name), CommandLauncher::new(args))
    }
}

impl<L: Launcher> ProcessTask<L> {
    pub fn new(spec: ProcessSpec, launcher: L) -> Self {
        Self { spec, launcher }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn spec_mut(&mut self) -> &mut ProcessSpec {
        &mut self.spec
    }

    /// Create the process now.
    ///
    /// Failures (missing executable, permission denied, no pty) are
    /// reported here, before any task is running.
    pub fn launch(&mut self) -> ProcessResult<RunningProcess> {
        let output = open_output(self.spec.output, self.spec.background)?;
        let pty = output.pty;

        let mut fds = std::mem::take(&mut self.spec.fd_map);
        if !fds.contains_key(&0) && (self.spec.background || self.spec.stdin_null) {
            fds.insert(0, File::open("/dev/null")?.into());
        }
        if !fds.contains_key(&1) {
            fds.insert(1, output.writer.try_clone()?);
        }
        if !fds.contains_key(&2) {
            fds.insert(2, output.writer.try_clone()?);
        }
        drop(output.writer);

        let pump = OutputPump::start(
            output.reader,
            !self.spec.background,
            self.spec.log_path.as_deref(),
        )?;

        let child = match self.launcher.launch(&self.spec, fds) {
            Ok(child) => child,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };
        info!(
            pid = %child.pid,
            "Started '{}' ({})", self.spec.name, self.launcher.describe()
        );

        Ok(RunningProcess {
            name: self.spec.name.clone(),
            pid: child.pid,
            exit: Some(child.exit),
            status: None,
            pump: Some(pump),
            pty,
        })
    }

    /// Launch and hand the running process to a started [`TaskHandle`].
    ///
    /// A launch failure is returned directly and no task is created.
    pub fn spawn(mut self) -> ProcessResult<TaskHandle> {
        let running = self.launch()?;
        Ok(TaskHandle::spawn(SupervisedProcess {
            running,
            cancel_timeout: self.spec.cancel_timeout,
        }))
    }
}

/// Wait for `running`, terminating it if `cancel` fires first
pub async fn supervise(
    running: &mut RunningProcess,
    cancel: &mut CancelSignal,
    cancel_timeout: Duration,
) -> ReturnCode {
    tokio::select! {
        status = running.wait() => match status {
            Ok(status) => status.returncode(),
            Err(e) => {
                error!("Lost track of process '{}': {}", running.name(), e);
                EX_SOFTWARE
            }
        },
        _ = cancel.cancelled() => {
            info!(pid = %running.pid(), "Cancelling process '{}'", running.name());
            match running.terminate(cancel_timeout).await {
                Termination::Exited(status) => status.returncode(),
                Termination::Orphaned => EX_SOFTWARE,
            }
        }
    }
}

#[async_trait]
impl<L: Launcher> Task for ProcessTask<L> {
    fn name(&self) -> String {
        self.spec.name.clone()
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        if cancel.is_cancelled() {
            debug!("Process '{}' cancelled before launch", self.spec.name);
            return CANCELLED_RETURNCODE;
        }
        let mut running = match self.launch() {
            Ok(running) => running,
            Err(e) => {
                error!("{}", e);
                return e.returncode();
            }
        };
        supervise(&mut running, &mut cancel, self.spec.cancel_timeout).await
    }
}

/// Task wrapping a process that is already running
struct SupervisedProcess {
    running: RunningProcess,
    cancel_timeout: Duration,
}

#[async_trait]
impl Task for SupervisedProcess {
    fn name(&self) -> String {
        self.running.name().to_string()
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        supervise(&mut self.running, &mut cancel, self.cancel_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use std::os::unix::process::CommandExt;
    use std::time::Instant;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn sh(name: &str, script: &str) -> ProcessTask<CommandLauncher> {
        let mut task = ProcessTask::command(name, ["/bin/sh", "-c", script]);
        task.spec_mut().background = true;
        task.spec_mut().output = OutputMode::Pipe;
        task
    }

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(ProcessExit::Exited(3).returncode(), 3);
        assert_eq!(ProcessExit::Signaled(9).returncode(), -9);
        assert_eq!(ProcessExit::Signaled(9).cli_exit_code(), 137);
        assert_eq!(ProcessExit::Signaled(15).signal(), Some(15));
        assert_eq!(ProcessExit::Exited(0).signal(), None);
    }

    #[tokio::test]
    async fn test_exit_code_is_returncode() {
        let handle = TaskHandle::spawn(sh("exit3", "exit 3"));
        assert_eq!(handle.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_signal_death_is_negative() {
        let handle = TaskHandle::spawn(sh("selfkill", "kill -9 $$"));
        assert_eq!(handle.wait().await.unwrap(), -9);
    }

    #[tokio::test]
    async fn test_output_is_appended_to_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("build.log");
        std::fs::write(&log, "previous\n").unwrap();

        let mut task = sh("echo", "echo hello; echo world >&2");
        task.spec_mut().log_path = Some(log.clone());
        let handle = TaskHandle::spawn(task);
        assert_eq!(handle.wait().await.unwrap(), 0);

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.starts_with("previous\n"));
        assert!(contents.contains("hello\n"));
        assert!(contents.contains("world\n"));
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("env.log");
        let mut task = sh("env", "printf '%s %s' \"$KILN_TEST\" \"$(pwd)\"");
        task.spec_mut().env.insert("KILN_TEST".into(), "value".into());
        task.spec_mut().cwd = Some(dir.path().to_path_buf());
        task.spec_mut().log_path = Some(log.clone());

        let handle = TaskHandle::spawn(task);
        assert_eq!(handle.wait().await.unwrap(), 0);
        let contents = std::fs::read_to_string(&log).unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        assert_eq!(contents, format!("value {}", cwd.display()));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_before_running() {
        let task = ProcessTask::command("missing", ["/nonexistent/kiln-no-such-binary"]);
        let err = task.spawn().unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(err.returncode(), 127);
    }

    #[tokio::test]
    async fn test_missing_executable_as_task_returns_127() {
        let mut task = ProcessTask::command("missing", ["/nonexistent/kiln-no-such-binary"]);
        task.spec_mut().output = OutputMode::Pipe;
        let handle = TaskHandle::spawn(task);
        assert_eq!(handle.wait().await.unwrap(), 127);
    }

    #[tokio::test]
    async fn test_cancel_sends_sigterm() {
        let handle = sh("sleeper", "exec sleep 30").spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        assert_eq!(handle.wait().await.unwrap(), -15);
        assert_eq!(handle.state(), TaskState::Done);
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_sigkill() {
        let mut task = sh("stubborn", "trap '' TERM; while :; do sleep 0.05; done");
        task.spec_mut().cancel_timeout = Duration::from_millis(200);
        let handle = task.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        handle.cancel();
        assert_eq!(handle.wait().await.unwrap(), -9);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_before_run_never_launches() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("started");
        let task = sh("marker", &format!("touch '{}'", marker.display()));

        let handle = TaskHandle::spawn(task);
        handle.cancel();
        assert_eq!(handle.wait().await.unwrap(), crate::task::CANCELLED_RETURNCODE);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_pty_output_is_logged_byte_exact() {
        if nix::pty::openpty(None, None).is_err() {
            // No pseudo-terminals in this environment.
            return;
        }
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("pty.log");
        let mut task = sh("pty", r"printf 'one\ntwo\r\nthree'; [ -t 1 ] || exit 9");
        task.spec_mut().output = OutputMode::Pty;
        task.spec_mut().log_path = Some(log.clone());

        let mut running = task.launch().unwrap();
        assert!(running.pty_used());
        assert_eq!(running.wait().await.unwrap(), ProcessExit::Exited(0));
        assert_eq!(std::fs::read(&log).unwrap(), b"one\ntwo\r\nthree");
    }

    #[tokio::test]
    async fn test_child_joins_cgroup_before_exec() {
        let dir = TempDir::new().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").unwrap();
        let mut task = sh("joins", "exit 0");
        task.spec_mut().cgroup_procs = Some(procs.clone());

        let mut running = task.launch().unwrap();
        assert_eq!(running.wait().await.unwrap(), ProcessExit::Exited(0));
        assert_eq!(
            std::fs::read_to_string(&procs).unwrap(),
            format!("{}\n", running.pid())
        );
    }

    #[tokio::test]
    async fn test_missing_cgroup_fails_launch() {
        let dir = TempDir::new().unwrap();
        let mut task = sh("joins", "exit 0");
        task.spec_mut().cgroup_procs = Some(dir.path().join("gone").join("cgroup.procs"));
        assert!(task.launch().is_err());
    }

    #[tokio::test]
    async fn test_pipe_output_is_not_a_pty() {
        let mut running = sh("pipe", "[ -t 1 ] && exit 9; exit 0").launch().unwrap();
        assert!(!running.pty_used());
        assert_eq!(running.wait().await.unwrap(), ProcessExit::Exited(0));
    }

    /// Starts a real child but never reports its exit
    struct UnreapableLauncher;

    impl Launcher for UnreapableLauncher {
        fn describe(&self) -> String {
            "sleep (unreapable)".into()
        }

        fn launch(&mut self, _spec: &ProcessSpec, _fds: FdMap) -> ProcessResult<SpawnedChild> {
            let child = std::process::Command::new("sleep")
                .arg("30")
                .process_group(0)
                .spawn()
                .map_err(|e| ProcessError::Spawn {
                    program: "sleep".into(),
                    source: e,
                })?;
            Ok(SpawnedChild {
                pid: Pid::from_raw(child.id() as i32),
                exit: Box::pin(std::future::pending()),
            })
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreaped_process_is_reported_as_orphan() {
        let mut spec = ProcessSpec::new("unreapable");
        spec.background = true;
        spec.output = OutputMode::Pipe;
        spec.cancel_timeout = Duration::from_millis(100);
        let handle = TaskHandle::spawn(ProcessTask::new(spec, UnreapableLauncher));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        handle.cancel();
        assert_eq!(handle.wait().await.unwrap(), EX_SOFTWARE);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(logs_contain("sending SIGKILL"));
        assert!(logs_contain("Orphan process 'unreapable' survived SIGKILL"));
    }
}
