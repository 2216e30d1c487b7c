//! Output capture for supervised processes
//!
//! A child writes to either a pipe or the slave side of a pseudo-terminal.
//! The parent keeps the read side and pumps it on the runtime, echoing to
//! stdout and appending to the log file.

use super::{OutputMode, ProcessError, ProcessResult};
use nix::libc;
use nix::fcntl::OFlag;
use nix::pty::openpty;
use nix::sys::termios::{OutputFlags, SetArg, tcgetattr, tcsetattr};
use nix::unistd::pipe2;
use std::io::{self, IsTerminal};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// Read and write ends of a child's output stream
pub(crate) struct OutputChannel {
    pub reader: OwnedFd,
    pub writer: OwnedFd,
    pub pty: bool,
}

/// Create the pipe or pty a child will write to
pub(crate) fn open_output(mode: OutputMode, background: bool) -> ProcessResult<OutputChannel> {
    let use_pty = match mode {
        OutputMode::Pty => true,
        OutputMode::Pipe => false,
        OutputMode::Auto => !background && io::stdout().is_terminal(),
    };

    if use_pty {
        match open_pty() {
            Ok(channel) => return Ok(channel),
            Err(e) => debug!("Falling back to a pipe, pty allocation failed: {}", e),
        }
    }

    let (reader, writer) = pipe2(OFlag::O_CLOEXEC)?;
    Ok(OutputChannel {
        reader,
        writer,
        pty: false,
    })
}

fn open_pty() -> ProcessResult<OutputChannel> {
    let winsize = terminal_size();
    let pty = openpty(winsize.as_ref(), None)?;

    // Keep output byte-exact in the log: no \n -> \r\n translation.
    let mut termios = tcgetattr(&pty.slave)?;
    termios.output_flags.remove(OutputFlags::OPOST);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;

    set_cloexec(pty.master.as_raw_fd())?;
    set_cloexec(pty.slave.as_raw_fd())?;
    Ok(OutputChannel {
        reader: pty.master,
        writer: pty.slave,
        pty: true,
    })
}

/// Window size of the controlling terminal, if stdout is one
fn terminal_size() -> Option<libc::winsize> {
    let stdout = io::stdout();
    if !stdout.is_terminal() {
        return None;
    }
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes a winsize into the provided, correctly sized struct.
    let rc = unsafe { libc::ioctl(stdout.as_raw_fd(), libc::TIOCGWINSZ, &mut size) };
    (rc == 0 && size.ws_row > 0).then_some(size)
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Background task copying a child's output to stdout and the log file
pub(crate) struct OutputPump {
    handle: JoinHandle<()>,
}

impl OutputPump {
    pub fn start(reader: OwnedFd, echo: bool, log_path: Option<&Path>) -> ProcessResult<Self> {
        set_nonblocking(reader.as_raw_fd()).map_err(ProcessError::Io)?;
        let reader = AsyncFd::new(reader).map_err(ProcessError::Io)?;

        let log = match log_path {
            Some(path) => Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| ProcessError::LogFile {
                        path: path.to_path_buf(),
                        source: e,
                    })?,
            ),
            None => None,
        };

        let handle = tokio::spawn(async move {
            let mut log = log.map(tokio::fs::File::from_std);
            let mut stdout = tokio::io::stdout();
            let mut buf = vec![0u8; READ_BUFFER_SIZE];

            loop {
                let mut guard = match reader.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("Output readiness error: {}", e);
                        break;
                    }
                };

                let read = guard.try_io(|inner| {
                    let fd = inner.get_ref().as_raw_fd();
                    // SAFETY: reading into a valid buffer from a non-blocking fd we own.
                    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });

                match read {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        let chunk = &buf[..n];
                        if echo {
                            let _ = stdout.write_all(chunk).await;
                            let _ = stdout.flush().await;
                        }
                        if let Some(file) = log.as_mut() {
                            if let Err(e) = file.write_all(chunk).await {
                                warn!("Failed to write process log: {}", e);
                                log = None;
                            }
                        }
                    }
                    // A pty master reports EIO once every slave is closed.
                    Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => break,
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Ok(Err(e)) => {
                        warn!("Output read error: {}", e);
                        break;
                    }
                    Err(_would_block) => {}
                }
            }

            if let Some(mut file) = log {
                let _ = file.flush().await;
            }
        });

        Ok(Self { handle })
    }

    /// Let the pump drain remaining output, giving up after `drain`.
    ///
    /// Descendants that keep the write side open would otherwise hold the
    /// pump forever.
    pub async fn finish(mut self, drain: Duration) {
        if tokio::time::timeout(drain, &mut self.handle).await.is_err() {
            debug!("Output still open after process exit, detaching");
            self.handle.abort();
        }
    }

    pub fn abort(self) {
        self.handle.abort();
    }
}
