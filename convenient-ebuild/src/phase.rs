//! Supervision of a single build phase
//!
//! A phase is one run of the configured phase command. Around the process
//! the supervisor:
//!
//! - checks and locks the build directory (unless an enclosing stage holds it)
//! - serves the IPC command channel, or arms the exit-file sentinel
//! - isolates the process in a cgroup when configured
//! - gives a script that reported its exit code a grace window to exit,
//!   then terminates it
//! - classifies abnormal endings and reports them on the log and package log
//!
//! The returncode becomes visible only after the channel is down and the
//! lock released.

use crate::builddir::{BuildDirectoryLock, LockMode, LockRegistry, PendingResult};
use crate::cgroup::CgroupIsolation;
use crate::ipc::{IpcDaemon, IpcPaths};
use crate::query::QueryHandler;
use crate::settings::{BuildSettings, phase_needs_builddir};
use async_trait::async_trait;
use convenient_task::process::{ProcessTask, RunningProcess, Termination};
use convenient_task::{
    CANCELLED_RETURNCODE, CancelSignal, CommandLauncher, EX_SOFTWARE, ReturnCode, Task,
};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How the supervisor learns that a script finished on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessChannel {
    /// The script sends `exit <code>` over the IPC channel
    Ipc,
    /// The script creates the `.exit_status` sentinel before exiting
    ExitFile,
}

impl LivenessChannel {
    /// Channel used for `phase`, if any
    pub fn for_phase(settings: &BuildSettings, phase: &str) -> Option<Self> {
        if !phase_needs_builddir(phase) {
            None
        } else if settings.features.ipc {
            Some(LivenessChannel::Ipc)
        } else {
            Some(LivenessChannel::ExitFile)
        }
    }
}

enum Outcome {
    Exited(io::Result<ReturnCode>),
    Reported(i32),
    Cancelled,
}

/// Task running one phase of one package
pub struct PhaseSupervisor {
    settings: Arc<BuildSettings>,
    phase: String,
    locks: LockRegistry,
    lock_mode: LockMode,
    queries: Arc<QueryHandler>,
}

impl fmt::Debug for PhaseSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseSupervisor")
            .field("package", &self.settings.package)
            .field("phase", &self.phase)
            .finish()
    }
}

impl PhaseSupervisor {
    pub fn new(
        settings: Arc<BuildSettings>,
        phase: impl Into<String>,
        locks: LockRegistry,
        lock_mode: LockMode,
        queries: Arc<QueryHandler>,
    ) -> Self {
        Self {
            settings,
            phase: phase.into(),
            locks,
            lock_mode,
            queries,
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Log an error for this phase and append it to the package log
    async fn eerror(&self, message: &str) {
        error!(
            package = %self.settings.package,
            phase = %self.phase,
            "{}", message
        );
        let Some(log_file) = self.settings.log_file.as_deref() else {
            return;
        };
        if let Err(e) = append_log(log_file, &format!(" * {}\n", message)).await {
            debug!("Failed to append to {}: {}", log_file.display(), e);
        }
    }

    fn build_process(
        &self,
        liveness: Option<LivenessChannel>,
        ipc: Option<&IpcPaths>,
    ) -> ProcessTask<CommandLauncher> {
        let settings = &self.settings;
        let mut args = settings.phase_command.clone();
        args.push(self.phase.clone());

        let mut task = ProcessTask::command(format!("{} {}", settings.package, self.phase), args);
        let spec = task.spec_mut();
        spec.env = settings.phase_env(&self.phase);
        match (liveness, ipc) {
            (Some(LivenessChannel::Ipc), Some(paths)) => {
                spec.env
                    .insert("KILN_IPC_IN".into(), paths.input.display().to_string());
                spec.env
                    .insert("KILN_IPC_OUT".into(), paths.output.display().to_string());
                spec.env.insert("KILN_IPC_DAEMON".into(), "1".into());
            }
            (Some(LivenessChannel::ExitFile), _) => {
                spec.env.insert(
                    "KILN_EXIT_FILE".into(),
                    settings.exit_file().display().to_string(),
                );
            }
            _ => {}
        }
        if liveness.is_some() {
            spec.cwd = Some(settings.builddir.clone());
        }
        spec.background = settings.background;
        spec.stdin_null = !settings.phase_is_interactive(&self.phase);
        spec.log_path = settings.log_file.clone();
        spec.uid = settings.uid;
        spec.gid = settings.gid;
        spec.cancel_timeout = settings.cancel_timeout;
        task
    }

    /// Everything after the lock: channel, process, classification
    async fn run_phase(&self, cancel: &mut CancelSignal) -> ReturnCode {
        let settings = &self.settings;
        let liveness = LivenessChannel::for_phase(settings, &self.phase);

        let daemon = match liveness {
            Some(LivenessChannel::Ipc) => {
                match IpcDaemon::start(IpcPaths::new(settings.ipc_dir()), self.queries.clone()) {
                    Ok(daemon) => Some(daemon),
                    Err(e) => {
                        self.eerror(&format!("Failed to start the IPC channel: {}", e))
                            .await;
                        return 1;
                    }
                }
            }
            Some(LivenessChannel::ExitFile) => {
                match tokio::fs::remove_file(settings.exit_file()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        self.eerror(&format!(
                            "Failed to remove {}: {}",
                            settings.exit_file().display(),
                            e
                        ))
                        .await;
                        return 1;
                    }
                }
                None
            }
            None => None,
        };

        if let Some(log_dir) = settings.log_file.as_deref().and_then(Path::parent) {
            if let Err(e) = tokio::fs::create_dir_all(log_dir).await {
                debug!("Failed to create {}: {}", log_dir.display(), e);
            }
        }

        if cancel.is_cancelled() {
            info!(
                package = %settings.package,
                phase = %self.phase,
                "Cancelled before launch"
            );
            if let Some(daemon) = daemon {
                daemon.shutdown();
            }
            return CANCELLED_RETURNCODE;
        }

        let cgroup = if liveness.is_some() {
            let settings = self.settings.clone();
            tokio::task::spawn_blocking(move || CgroupIsolation::for_phase(&settings))
                .await
                .unwrap_or(None)
        } else {
            None
        };

        let mut process = self.build_process(liveness, daemon.as_ref().map(IpcDaemon::paths));
        process.spec_mut().cgroup_procs = cgroup.as_ref().map(CgroupIsolation::procs_file);
        let mut running = match process.launch() {
            Ok(running) => running,
            Err(e) => {
                self.eerror(&format!("Failed to start phase '{}': {}", self.phase, e))
                    .await;
                if let Some(cgroup) = cgroup {
                    cgroup.teardown().await;
                }
                if let Some(daemon) = daemon {
                    daemon.shutdown();
                }
                return e.returncode();
            }
        };

        let mut exit_rx = daemon.as_ref().map(IpcDaemon::exit_receiver);
        let returncode = self
            .supervise(&mut running, cancel, &mut exit_rx, liveness)
            .await;

        if let Some(cgroup) = cgroup {
            cgroup.teardown().await;
        }
        if let Some(daemon) = daemon {
            daemon.shutdown();
        }
        returncode
    }

    async fn supervise(
        &self,
        running: &mut RunningProcess,
        cancel: &mut CancelSignal,
        exit_rx: &mut Option<watch::Receiver<Option<i32>>>,
        liveness: Option<LivenessChannel>,
    ) -> ReturnCode {
        let settings = &self.settings;

        let outcome = tokio::select! {
            status = running.wait() => Outcome::Exited(status.map(|s| s.returncode())),
            code = reported_exit(exit_rx) => Outcome::Reported(code),
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let (returncode, cancelled) = match outcome {
            Outcome::Exited(Ok(returncode)) => (returncode, false),
            Outcome::Exited(Err(e)) => {
                self.eerror(&format!("Lost track of phase '{}': {}", self.phase, e))
                    .await;
                return EX_SOFTWARE;
            }
            Outcome::Cancelled => {
                info!(
                    package = %settings.package,
                    phase = %self.phase,
                    pid = %running.pid(),
                    "Cancelling phase"
                );
                (self.terminate(running).await, true)
            }
            Outcome::Reported(code) => {
                debug!(
                    package = %settings.package,
                    phase = %self.phase,
                    "Script reported exit code {}, waiting up to {:?}", code, settings.exit_timeout
                );
                let natural = tokio::select! {
                    status = tokio::time::timeout(settings.exit_timeout, running.wait()) => status.ok(),
                    _ = cancel.cancelled() => None,
                };
                match natural {
                    Some(Ok(status)) => return status.returncode(),
                    Some(Err(e)) => {
                        warn!("Lost track of phase '{}': {}", self.phase, e);
                        return code;
                    }
                    None => {
                        info!(
                            package = %settings.package,
                            phase = %self.phase,
                            pid = %running.pid(),
                            "Phase did not exit after reporting, terminating"
                        );
                        self.terminate(running).await;
                        return code;
                    }
                }
            }
        };

        // A code reported just before the exit still counts.
        let reported = exit_rx.as_ref().and_then(|rx| *rx.borrow());
        let confirmed = match liveness {
            None => return returncode,
            Some(LivenessChannel::Ipc) => reported.is_some(),
            Some(LivenessChannel::ExitFile) => {
                cancelled || tokio::fs::try_exists(settings.exit_file()).await.unwrap_or(false)
            }
        };
        if confirmed {
            return returncode;
        }

        if returncode < 0 {
            if !cancelled {
                self.eerror(&format!(
                    "The phase '{}' has been killed by signal {}.",
                    self.phase, -returncode
                ))
                .await;
            }
            returncode
        } else {
            if !cancelled {
                self.eerror(&format!(
                    "The phase '{}' has exited unexpectedly. The script ended \
                     without reporting its exit status.",
                    self.phase
                ))
                .await;
            }
            1
        }
    }

    /// SIGTERM then SIGKILL; warn when the process outlives both
    async fn terminate(&self, running: &mut RunningProcess) -> ReturnCode {
        let pid = running.pid();
        match running.terminate(self.settings.cancel_timeout).await {
            Termination::Exited(status) => status.returncode(),
            Termination::Orphaned => {
                self.eerror(&format!(
                    "The phase '{}' with pid {} appears to have left an orphan \
                     process running in the background.",
                    self.phase, pid
                ))
                .await;
                EX_SOFTWARE
            }
        }
    }
}

/// Resolves with the exit code a script reports; pends without a channel
async fn reported_exit(rx: &mut Option<watch::Receiver<Option<i32>>>) -> i32 {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        let code = *rx.borrow_and_update();
        if let Some(code) = code {
            return code;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn append_log(path: &Path, text: &str) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

#[async_trait]
impl Task for PhaseSupervisor {
    fn name(&self) -> String {
        format!("{} {}", self.settings.package, self.phase)
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        let settings = Arc::clone(&self.settings);
        let needs_builddir = phase_needs_builddir(&self.phase);

        if needs_builddir && !settings.builddir.is_dir() {
            self.eerror(&format!(
                "The '{}' phase aborted since build dir does not exist: '{}'",
                self.phase,
                settings.builddir.display()
            ))
            .await;
            return 1;
        }

        if !needs_builddir || settings.builddir_locked {
            return self.run_phase(&mut cancel).await;
        }

        let lock = BuildDirectoryLock::new(&settings, self.locks.clone(), self.lock_mode);
        tokio::select! {
            acquired = lock.acquire() => {
                if let Err(e) = acquired {
                    self.eerror(&e.to_string()).await;
                    return 1;
                }
            }
            _ = cancel.cancelled() => {
                info!(
                    package = %settings.package,
                    phase = %self.phase,
                    "Cancelled while waiting for the build directory lock"
                );
                return CANCELLED_RETURNCODE;
            }
        }

        let returncode = self.run_phase(&mut cancel).await;
        lock.release_with_result(PendingResult::hold(returncode))
            .await
    }
}
