//! Supervisor side of the command channel

use super::protocol::{IpcCommand, IpcReply, QUERY_INVALID_COMMAND};
use super::{IpcError, IpcPaths, IpcResult};
use crate::query::QueryHandler;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Serves requests on the FIFOs of one build directory
pub struct IpcDaemon {
    paths: IpcPaths,
    exit_rx: watch::Receiver<Option<i32>>,
    task: JoinHandle<()>,
}

impl IpcDaemon {
    /// Create the FIFOs (mode 0770) and start serving
    pub fn start(paths: IpcPaths, handler: Arc<QueryHandler>) -> IpcResult<Self> {
        fs::create_dir_all(&paths.dir)?;
        for fifo in [&paths.input, &paths.output] {
            match fs::remove_file(fifo) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            mkfifo(fifo, Mode::from_bits_truncate(0o770)).map_err(|e| IpcError::Fifo {
                path: fifo.clone(),
                source: e,
            })?;
        }

        // Read-write keeps a writer open, so the stream never sees EOF
        // between clients.
        let input = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&paths.input)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let serve_paths = paths.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(input).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("IPC input error: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let (reply, exit_code) = match serde_json::from_str::<IpcCommand>(&line) {
                    Ok(IpcCommand::Exit { code }) => (IpcReply::ok(""), Some(code)),
                    Ok(command) => {
                        debug!("IPC request: {}", command.name());
                        (handler.handle(&command), None)
                    }
                    Err(e) => {
                        debug!("Rejecting IPC request {:?}: {}", line, e);
                        (
                            IpcReply::error(format!("Invalid command: {}\n", line.trim()), QUERY_INVALID_COMMAND),
                            None,
                        )
                    }
                };

                // Recorded before the reply: the script may exit as soon as
                // it reads it.
                if let Some(code) = exit_code {
                    debug!("Build script reported exit code {}", code);
                    exit_tx.send_replace(Some(code));
                }

                send_reply(&serve_paths, &reply).await;
            }
        });

        Ok(Self {
            paths,
            exit_rx,
            task,
        })
    }

    pub fn paths(&self) -> &IpcPaths {
        &self.paths
    }

    /// Exit code received so far, if any
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Receiver that changes once the script reports its exit code
    pub fn exit_receiver(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Stop serving and remove the FIFOs
    pub fn shutdown(self) {
        self.task.abort();
        for fifo in [&self.paths.input, &self.paths.output] {
            let _ = fs::remove_file(fifo);
        }
        debug!("IPC channel in {} closed", self.paths.dir.display());
    }
}

async fn send_reply(paths: &IpcPaths, reply: &IpcReply) {
    let mut line = match serde_json::to_vec(reply) {
        Ok(line) => line,
        Err(e) => {
            error!("Failed to encode IPC reply: {}", e);
            return;
        }
    };
    line.push(b'\n');

    // Non-blocking open: the client opens its end before sending, so ENXIO
    // means it is gone.
    match pipe::OpenOptions::new().open_sender(&paths.output) {
        Ok(mut sender) => {
            if let Err(e) = sender.write_all(&line).await {
                warn!("Failed to send IPC reply: {}", e);
            }
        }
        Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
            debug!("IPC client went away before the reply");
        }
        Err(e) => error!("Failed to send IPC reply: {}", e),
    }
}
