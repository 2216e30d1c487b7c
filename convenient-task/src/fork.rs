//! Running in-process functions in a child process
//!
//! A [`ForkTask`] executes a registered entry point in a new OS process and
//! supervises it like any other [`ProcessTask`]. Two descriptor strategies
//! exist:
//!
//! - [`InheritDescriptors`]: `fork(2)`; the child already shares our
//!   descriptors and just moves them onto the expected numbers.
//! - [`TransferDescriptors`]: re-executes the current binary; only one end of
//!   a socketpair is inherited (as fd 3) and the descriptor map is sent over
//!   it with `SCM_RIGHTS`. The binary must call [`child_main`] at the top of
//!   `main`.
//!
//! Panics and errors inside the entry point are caught in the child, logged
//! and turned into exit code 1.

use crate::process::{
    FdMap, Launcher, ProcessError, ProcessExit, ProcessResult, ProcessSpec, ProcessTask,
    SpawnedChild, install_descriptors, join_cgroup, open_cgroup_procs, park_descriptors,
};
use crate::task::EX_SOFTWARE;
use nix::libc;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, fork, setgid, setpgid, setuid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Environment variable naming the entry point in a re-executed child
pub const ENTRY_ENV: &str = "CONVENIENT_TASK_ENTRY";

/// Environment variable carrying the descriptor channel number
pub const CHANNEL_ENV: &str = "CONVENIENT_TASK_CHANNEL_FD";

/// Environment variable overriding [`ForkStrategy::detect`]
pub const STRATEGY_ENV: &str = "CONVENIENT_FORK_STRATEGY";

/// Descriptor number of the transfer channel in the child
const CHANNEL_FD: RawFd = 3;

/// Upper bound on descriptors sent in one transfer
const MAX_TRANSFER_FDS: usize = 32;

/// Exit code for a failing entry point
const ENTRY_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum ForkError {
    #[error("Unknown entry point: {0}")]
    UnknownEntryPoint(String),

    #[error("Descriptor transfer failed: {0}")]
    Transfer(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TransferResult<T> = Result<T, ForkError>;

/// Function that can be run in a child process
pub type EntryPoint = fn(&[String]) -> Result<i32, Box<dyn StdError + Send + Sync>>;

/// Registry of named entry points
#[derive(Clone, Default)]
pub struct EntryPoints {
    entries: BTreeMap<String, EntryPoint>,
}

impl fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl EntryPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, entry: EntryPoint) -> Self {
        self.entries.insert(name.into(), entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<EntryPoint> {
        self.entries.get(name).copied()
    }

    fn call(&self, name: &str, args: &[String]) -> EntryOutcome {
        let Some(entry) = self.get(name) else {
            return EntryOutcome::Unknown;
        };
        match std::panic::catch_unwind(|| entry(args)) {
            Ok(Ok(code)) => EntryOutcome::Exited(code),
            Ok(Err(e)) => EntryOutcome::Failed(e.to_string()),
            Err(_) => EntryOutcome::Panicked,
        }
    }

    /// Run `name` with `args`, converting errors and panics into exit codes
    pub fn invoke(&self, name: &str, args: &[String]) -> i32 {
        match self.call(name, args) {
            EntryOutcome::Exited(code) => code,
            EntryOutcome::Unknown => {
                error!("Unknown entry point '{}'", name);
                EX_SOFTWARE
            }
            EntryOutcome::Failed(message) => {
                error!("Entry point '{}' failed: {}", name, message);
                let _ = writeln!(io::stderr(), "{}: {}", name, message);
                ENTRY_FAILURE
            }
            EntryOutcome::Panicked => {
                error!("Entry point '{}' panicked", name);
                ENTRY_FAILURE
            }
        }
    }

    /// [`invoke`](Self::invoke) for a child created by `fork(2)`.
    ///
    /// Locks held by other threads of the parent stay held forever in the
    /// child, so failures are reported with a raw write to fd 2 instead of
    /// going through the log subscriber or the stderr handle.
    fn invoke_forked(&self, name: &str, args: &[String]) -> i32 {
        match self.call(name, args) {
            EntryOutcome::Exited(code) => code,
            EntryOutcome::Unknown => {
                write_stderr_raw(&format!("{}: unknown entry point\n", name));
                EX_SOFTWARE
            }
            EntryOutcome::Failed(message) => {
                write_stderr_raw(&format!("{}: {}\n", name, message));
                ENTRY_FAILURE
            }
            EntryOutcome::Panicked => {
                write_stderr_raw(&format!("{}: entry point panicked\n", name));
                ENTRY_FAILURE
            }
        }
    }
}

enum EntryOutcome {
    Exited(i32),
    Unknown,
    Failed(String),
    Panicked,
}

/// Write `message` straight to fd 2
fn write_stderr_raw(message: &str) {
    let mut bytes = message.as_bytes();
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live buffer of the given length.
        let written = unsafe { libc::write(2, bytes.as_ptr().cast(), bytes.len()) };
        if written < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if written == 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Entry point name and arguments for one child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkTarget {
    pub entry: String,
    pub args: Vec<String>,
}

impl ForkTarget {
    pub fn new<I, S>(entry: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entry: entry.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// How descriptors reach a child running an entry point
pub trait DescriptorStrategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn spawn(&self, target: &ForkTarget, spec: &ProcessSpec, fds: FdMap) -> ProcessResult<SpawnedChild>;
}

/// Which [`DescriptorStrategy`] to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkStrategy {
    #[default]
    Inherit,
    Transfer,
}

impl ForkStrategy {
    /// Strategy chosen by `CONVENIENT_FORK_STRATEGY`, defaulting to inherit
    pub fn detect() -> Self {
        match std::env::var(STRATEGY_ENV).as_deref() {
            Ok("transfer") => ForkStrategy::Transfer,
            _ => ForkStrategy::Inherit,
        }
    }

    pub fn build(self, entries: &EntryPoints) -> ProcessResult<Arc<dyn DescriptorStrategy>> {
        Ok(match self {
            ForkStrategy::Inherit => Arc::new(InheritDescriptors::new(entries.clone())),
            ForkStrategy::Transfer => Arc::new(TransferDescriptors::current_exe()?),
        })
    }
}

/// Child created with `fork(2)`, inheriting every descriptor
#[derive(Debug, Clone)]
pub struct InheritDescriptors {
    entries: EntryPoints,
}

impl InheritDescriptors {
    pub fn new(entries: EntryPoints) -> Self {
        Self { entries }
    }
}

impl DescriptorStrategy for InheritDescriptors {
    fn name(&self) -> &'static str {
        "inherit"
    }

    fn spawn(&self, target: &ForkTarget, spec: &ProcessSpec, fds: FdMap) -> ProcessResult<SpawnedChild> {
        if self.entries.get(&target.entry).is_none() {
            return Err(ForkError::UnknownEntryPoint(target.entry.clone()).into());
        }

        let parked = park_descriptors(&fds)?;
        let moves: Vec<(RawFd, RawFd)> = parked
            .iter()
            .map(|(target, fd)| (*target, fd.as_raw_fd()))
            .collect();
        let procs = open_cgroup_procs(spec)?;

        // SAFETY: the child only touches state it owns after the fork and
        // leaves through `_exit`, never returning into the runtime.
        match unsafe { fork() }.map_err(ForkError::from)? {
            ForkResult::Parent { child } => {
                // Also done in the child; whichever runs first wins.
                let _ = setpgid(child, child);
                drop(parked);
                drop(procs);
                drop(fds);
                debug!("Forked '{}' as {}", target.entry, child);
                Ok(SpawnedChild {
                    pid: child,
                    exit: Box::pin(wait_forked(child)),
                })
            }
            ForkResult::Child => {
                let procs_fd = procs.as_ref().map(AsRawFd::as_raw_fd);
                let code = match prepare_child(spec, &moves, procs_fd) {
                    Ok(()) => self.entries.invoke_forked(&target.entry, &target.args),
                    Err(e) => {
                        write_stderr_raw(&format!("{}: {}\n", target.entry, e));
                        EX_SOFTWARE
                    }
                };
                let _ = io::stdout().flush();
                // SAFETY: terminate the child without unwinding into parent state.
                unsafe { libc::_exit(code) }
            }
        }
    }
}

fn prepare_child(
    spec: &ProcessSpec,
    moves: &[(RawFd, RawFd)],
    procs: Option<RawFd>,
) -> io::Result<()> {
    if let Some(fd) = procs {
        join_cgroup(fd)?;
    }
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from)?;
    install_descriptors(moves)?;
    if let Some(mask) = spec.umask {
        // SAFETY: umask has no memory safety requirements.
        unsafe { libc::umask(mask as libc::mode_t) };
    }
    if spec.env_clear {
        for (key, _) in std::env::vars_os() {
            // SAFETY: the forked child is single threaded.
            unsafe { std::env::remove_var(key) };
        }
    }
    for (key, value) in &spec.env {
        // SAFETY: the forked child is single threaded.
        unsafe { std::env::set_var(key, value) };
    }
    if let Some(cwd) = &spec.cwd {
        std::env::set_current_dir(cwd)?;
    }
    if let Some(gid) = spec.gid {
        setgid(Gid::from_raw(gid)).map_err(io::Error::from)?;
    }
    if let Some(uid) = spec.uid {
        setuid(Uid::from_raw(uid)).map_err(io::Error::from)?;
    }
    Ok(())
}

async fn wait_forked(pid: Pid) -> io::Result<ProcessExit> {
    tokio::task::spawn_blocking(move || loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ProcessExit::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ProcessExit::Signaled(signal as i32));
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    })
    .await
    .map_err(io::Error::other)?
}

/// Child created by re-executing a binary that calls [`child_main`]
#[derive(Debug, Clone)]
pub struct TransferDescriptors {
    executable: PathBuf,
}

impl TransferDescriptors {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn current_exe() -> ProcessResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

/// Header sent ahead of the descriptors
#[derive(Debug, Serialize, Deserialize)]
struct TransferHeader {
    targets: Vec<i32>,
    args: Vec<String>,
}

impl DescriptorStrategy for TransferDescriptors {
    fn name(&self) -> &'static str {
        "transfer"
    }

    fn spawn(&self, target: &ForkTarget, spec: &ProcessSpec, mut fds: FdMap) -> ProcessResult<SpawnedChild> {
        // An inherited stdin has to travel with the others; the re-executed
        // binary starts on /dev/null.
        if !fds.contains_key(&0) {
            match io::stdin().as_fd().try_clone_to_owned() {
                Ok(stdin) => {
                    fds.insert(0, stdin);
                }
                Err(e) => debug!("Not passing stdin to '{}': {}", target.entry, e),
            }
        }
        if fds.len() > MAX_TRANSFER_FDS {
            return Err(ForkError::Transfer(format!("too many descriptors: {}", fds.len())).into());
        }
        let (parent_end, child_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(ForkError::from)?;

        let mut cmd = Command::new(&self.executable);
        if spec.env_clear {
            cmd.env_clear();
        }
        cmd.envs(&spec.env)
            .env(ENTRY_ENV, &target.entry)
            .env(CHANNEL_ENV, CHANNEL_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(uid) = spec.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = spec.gid {
            cmd.gid(gid);
        }
        let channel = child_end.as_raw_fd();
        let umask = spec.umask;
        let procs = open_cgroup_procs(spec)?;
        let procs_fd = procs.as_ref().map(AsRawFd::as_raw_fd);
        // SAFETY: only async-signal-safe libc calls, no allocation.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(fd) = procs_fd {
                    join_cgroup(fd)?;
                }
                if let Some(mask) = umask {
                    libc::umask(mask as libc::mode_t);
                }
                if channel == CHANNEL_FD {
                    if libc::fcntl(channel, libc::F_SETFD, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(channel, CHANNEL_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            program: self.executable.display().to_string(),
            source: e,
        })?;
        drop(cmd);
        drop(child_end);
        drop(procs);
        let pid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .ok_or_else(|| ForkError::Transfer("child exited before its pid was read".into()))?;

        let header = TransferHeader {
            targets: fds.keys().copied().collect(),
            args: target.args.clone(),
        };
        let entry = target.entry.clone();
        let exit = async move {
            let sent = tokio::task::spawn_blocking(move || send_fds(parent_end, &header, fds))
                .await
                .map_err(io::Error::other)?;
            if let Err(e) = sent {
                error!("Failed to hand descriptors to '{}': {}", entry, e);
            }
            child.wait().await.map(ProcessExit::from)
        };

        Ok(SpawnedChild {
            pid,
            exit: Box::pin(exit),
        })
    }
}

fn send_fds(channel: OwnedFd, header: &TransferHeader, fds: FdMap) -> TransferResult<()> {
    let body = serde_json::to_vec(header)?;
    let mut payload = Vec::with_capacity(body.len() + 4);
    payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
    payload.extend_from_slice(&body);

    let raw: Vec<RawFd> = fds.values().map(|fd| fd.as_raw_fd()).collect();
    let iov = [IoSlice::new(&payload)];
    let cmsg = [ControlMessage::ScmRights(&raw)];
    let sent = sendmsg::<()>(channel.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;

    let mut stream = UnixStream::from(channel);
    stream.write_all(&payload[sent..])?;
    drop(fds);
    Ok(())
}

fn recv_fds(channel: OwnedFd) -> TransferResult<(TransferHeader, FdMap)> {
    let mut first = vec![0u8; 64 * 1024];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_TRANSFER_FDS]);
    let (received, raw_fds) = {
        let mut iov = [IoSliceMut::new(&mut first)];
        let msg = recvmsg::<()>(
            channel.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;
        let mut raw_fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                raw_fds.extend(fds);
            }
        }
        (msg.bytes, raw_fds)
    };
    // SAFETY: SCM_RIGHTS installed these descriptors for us alone.
    let owned: Vec<OwnedFd> = raw_fds
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if received < 4 {
        return Err(ForkError::Transfer("truncated header".into()));
    }
    let mut stream = UnixStream::from(channel);
    let mut payload = first[..received].to_vec();
    let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() < len + 4 {
        let mut rest = vec![0u8; len + 4 - payload.len()];
        stream.read_exact(&mut rest)?;
        payload.extend_from_slice(&rest);
    }
    let header: TransferHeader = serde_json::from_slice(&payload[4..4 + len])?;

    if header.targets.len() != owned.len() {
        return Err(ForkError::Transfer(format!(
            "expected {} descriptors, received {}",
            header.targets.len(),
            owned.len()
        )));
    }
    let fds: FdMap = header.targets.iter().copied().zip(owned).collect();
    Ok((header, fds))
}

/// Run the requested entry point if this process is a re-executed child.
///
/// Returns `None` in a normal process. Otherwise the descriptors are
/// received and installed, the entry point runs and its exit code is
/// returned; the caller should exit with it immediately.
pub fn child_main(entries: &EntryPoints) -> Option<i32> {
    let entry = std::env::var(ENTRY_ENV).ok()?;
    let channel: RawFd = std::env::var(CHANNEL_ENV)
        .ok()
        .and_then(|fd| fd.parse().ok())
        .unwrap_or(CHANNEL_FD);
    // SAFETY: called first thing in main, before any other thread exists.
    unsafe {
        std::env::remove_var(ENTRY_ENV);
        std::env::remove_var(CHANNEL_ENV);
    }

    // SAFETY: the parent installed the channel at this number for us.
    let channel = unsafe { OwnedFd::from_raw_fd(channel) };
    let (header, fds) = match recv_fds(channel) {
        Ok(received) => received,
        Err(e) => {
            error!("Entry point '{}' did not receive its descriptors: {}", entry, e);
            return Some(EX_SOFTWARE);
        }
    };

    let installed = park_descriptors(&fds).and_then(|parked| {
        let moves: Vec<(RawFd, RawFd)> = parked
            .iter()
            .map(|(target, fd)| (*target, fd.as_raw_fd()))
            .collect();
        install_descriptors(&moves)
    });
    drop(fds);
    if let Err(e) = installed {
        error!("Entry point '{}' could not install descriptors: {}", entry, e);
        return Some(EX_SOFTWARE);
    }

    let code = entries.invoke(&entry, &header.args);
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    Some(code)
}

/// Launcher running a [`ForkTarget`] through a [`DescriptorStrategy`]
pub struct ForkLauncher {
    target: ForkTarget,
    strategy: Arc<dyn DescriptorStrategy>,
}

impl ForkLauncher {
    pub fn new(target: ForkTarget, strategy: Arc<dyn DescriptorStrategy>) -> Self {
        Self { target, strategy }
    }
}

impl Launcher for ForkLauncher {
    fn describe(&self) -> String {
        format!("{} via {}", self.target.entry, self.strategy.name())
    }

    fn launch(&mut self, spec: &ProcessSpec, fds: FdMap) -> ProcessResult<SpawnedChild> {
        self.strategy.spawn(&self.target, spec, fds)
    }
}

/// A process task whose process runs an in-process entry point
pub type ForkTask = ProcessTask<ForkLauncher>;

impl ProcessTask<ForkLauncher> {
    pub fn fork(
        name: impl Into<String>,
        target: ForkTarget,
        strategy: Arc<dyn DescriptorStrategy>,
    ) -> Self {
        ProcessTask::new(ProcessSpec::new(name), ForkLauncher::new(target, strategy))
    }
}
