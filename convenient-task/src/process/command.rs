use super::{FdMap, Launcher, ProcessError, ProcessExit, ProcessResult, ProcessSpec, SpawnedChild};
use nix::libc;
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use tokio::process::Command;

/// Lowest descriptor used to park sources before they are moved into place
const FD_PARKING_BASE: RawFd = 100;

/// Launches an executable with arguments
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Launcher for CommandLauncher {
    fn describe(&self) -> String {
        self.args.first().cloned().unwrap_or_default()
    }

    fn launch(&mut self, spec: &ProcessSpec, mut fds: FdMap) -> ProcessResult<SpawnedChild> {
        let (program, args) = self
            .args
            .split_first()
            .ok_or_else(|| ProcessError::EmptyCommand(spec.name.clone()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if spec.env_clear {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(uid) = spec.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = spec.gid {
            cmd.gid(gid);
        }
        cmd.process_group(0);

        match fds.remove(&0) {
            Some(fd) => cmd.stdin(Stdio::from(fd)),
            None => cmd.stdin(Stdio::inherit()),
        };
        match fds.remove(&1) {
            Some(fd) => cmd.stdout(Stdio::from(fd)),
            None => cmd.stdout(Stdio::inherit()),
        };
        match fds.remove(&2) {
            Some(fd) => cmd.stderr(Stdio::from(fd)),
            None => cmd.stderr(Stdio::inherit()),
        };

        // Remaining descriptors are parked close-on-exec above the usual
        // range and moved into place in the child.
        let parked = park_descriptors(&fds)?;
        let moves: Vec<(RawFd, RawFd)> = parked
            .iter()
            .map(|(target, fd)| (*target, fd.as_raw_fd()))
            .collect();
        let umask = spec.umask;
        let procs = open_cgroup_procs(spec)?;
        let procs_fd = procs.as_ref().map(AsRawFd::as_raw_fd);
        if !moves.is_empty() || umask.is_some() || procs_fd.is_some() {
            // SAFETY: the closure only calls async-signal-safe libc functions
            // and does not allocate.
            unsafe {
                cmd.pre_exec(move || {
                    if let Some(fd) = procs_fd {
                        join_cgroup(fd)?;
                    }
                    if let Some(mask) = umask {
                        libc::umask(mask as libc::mode_t);
                    }
                    install_descriptors(&moves)
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            program: program.clone(),
            source: e,
        })?;
        drop(cmd);
        drop(parked);
        drop(procs);
        drop(fds);

        let pid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .ok_or_else(|| ProcessError::Io(io::Error::other("child exited before its pid was read")))?;

        Ok(SpawnedChild {
            pid,
            exit: Box::pin(async move { child.wait().await.map(ProcessExit::from) }),
        })
    }
}

/// Duplicate every descriptor in `fds` above [`FD_PARKING_BASE`] with
/// close-on-exec set, so installing one target can never clobber a source
/// still waiting to be installed.
pub(crate) fn park_descriptors(fds: &FdMap) -> io::Result<Vec<(RawFd, OwnedFd)>> {
    fds.iter()
        .map(|(target, fd)| {
            // SAFETY: duplicating a descriptor we own; the result is owned below.
            let parked = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, FD_PARKING_BASE) };
            if parked < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `parked` is a fresh descriptor nothing else owns.
            Ok((*target, unsafe { OwnedFd::from_raw_fd(parked) }))
        })
        .collect()
}

/// Move parked descriptors onto their target numbers.
///
/// Runs in the child between fork and exec: no allocation, only dup2,
/// which also clears close-on-exec on the target.
pub(crate) fn install_descriptors(moves: &[(RawFd, RawFd)]) -> io::Result<()> {
    for &(target, parked) in moves {
        // SAFETY: plain descriptor duplication.
        if unsafe { libc::dup2(parked, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Open the `cgroup.procs` file named by `spec`, close-on-exec
pub(crate) fn open_cgroup_procs(spec: &ProcessSpec) -> io::Result<Option<OwnedFd>> {
    spec.cgroup_procs
        .as_deref()
        .map(|path| OpenOptions::new().append(true).open(path).map(OwnedFd::from))
        .transpose()
}

/// Write the calling process's pid to an open `cgroup.procs`.
///
/// Runs in the child between fork and exec, so the pid is formatted into a
/// stack buffer.
pub(crate) fn join_cgroup(procs: RawFd) -> io::Result<()> {
    let mut buf = [0u8; 16];
    let mut pos = buf.len() - 1;
    buf[pos] = b'\n';
    // SAFETY: getpid has no preconditions.
    let mut pid = unsafe { libc::getpid() } as u32;
    loop {
        pos -= 1;
        buf[pos] = b'0' + (pid % 10) as u8;
        pid /= 10;
        if pid == 0 {
            break;
        }
    }
    let line = &buf[pos..];
    // SAFETY: `line` is a live stack buffer of the given length.
    if unsafe { libc::write(procs, line.as_ptr().cast(), line.len()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
