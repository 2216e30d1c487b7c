//! Build-script side of the command channel

use super::protocol::{IpcCommand, IpcReply};
use super::{IpcError, IpcPaths, IpcResult};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tracing::debug;

/// Default time to wait for a reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends commands to an [`IpcDaemon`](super::IpcDaemon)
#[derive(Debug, Clone)]
pub struct IpcClient {
    paths: IpcPaths,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(paths: IpcPaths) -> Self {
        Self {
            paths,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Client for the FIFOs named by `KILN_IPC_IN`/`KILN_IPC_OUT`
    pub fn from_env() -> Option<Self> {
        let input = std::env::var_os("KILN_IPC_IN")?;
        let output = std::env::var_os("KILN_IPC_OUT")?;
        let input = std::path::PathBuf::from(input);
        let dir = input.parent()?.to_path_buf();
        Some(Self::new(IpcPaths {
            lock: dir.join("lock"),
            output: output.into(),
            input,
            dir,
        }))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one command and wait for its reply
    pub async fn request(&self, command: &IpcCommand) -> IpcResult<IpcReply> {
        let lock_path = self.paths.lock.clone();
        let _lock: Flock<File> = tokio::task::spawn_blocking(move || -> IpcResult<Flock<File>> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| IpcError::Nix(errno))
        })
        .await
        .map_err(|e| IpcError::Io(std::io::Error::other(e)))??;

        // Open our reading end first so the daemon's non-blocking open of
        // the reply FIFO finds a reader.
        let output = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&self.paths.output)?;
        let mut input = pipe::OpenOptions::new().open_sender(&self.paths.input)?;

        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        input.write_all(&line).await?;
        debug!("Sent IPC request {}", command.name());

        let mut reply = String::new();
        let mut output = BufReader::new(output);
        let read = tokio::time::timeout(self.timeout, output.read_line(&mut reply))
            .await
            .map_err(|_| IpcError::Timeout(self.timeout))??;
        if read == 0 {
            return Err(IpcError::Closed);
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcDaemon;
    use crate::ipc::protocol::{QUERY_INVALID_COMMAND, QUERY_NOT_FOUND};
    use crate::query::{QueryHandler, StaticPackageDatabase};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn handler() -> Arc<QueryHandler> {
        let yaml = r#"
roots:
  /:
    installed: ["dev-lang/perl-5.38.2", "dev-lang/perl-5.36.0"]
repositories:
  - name: gentoo
    location: /var/db/repos/gentoo
    eclasses:
      toolchain-funcs: /var/db/repos/gentoo/eclass/toolchain-funcs.eclass
"#;
        Arc::new(QueryHandler::new(Arc::new(
            StaticPackageDatabase::from_yaml(yaml).unwrap(),
        )))
    }

    #[tokio::test]
    async fn test_round_trip_through_fifos() {
        let dir = TempDir::new().unwrap();
        let paths = IpcPaths::new(dir.path().join(".ipc"));
        let daemon = IpcDaemon::start(paths.clone(), handler()).unwrap();
        let client = IpcClient::new(paths).with_timeout(Duration::from_secs(5));

        let reply = client
            .request(&IpcCommand::BestVersion {
                root: "/".into(),
                atom: "dev-lang/perl".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply, IpcReply::ok("dev-lang/perl-5.38.2\n"));

        let reply = client
            .request(&IpcCommand::HasVersion {
                root: "/".into(),
                atom: "dev-lang/python".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply.returncode, QUERY_NOT_FOUND);

        let reply = client
            .request(&IpcCommand::HasVersion {
                root: "/nonexistent".into(),
                atom: "dev-lang/perl".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply.returncode, QUERY_INVALID_COMMAND);

        assert_eq!(daemon.exit_code(), None);
        let reply = client.request(&IpcCommand::Exit { code: 4 }).await.unwrap();
        assert_eq!(reply.returncode, 0);

        let mut exit = daemon.exit_receiver();
        let code = exit.wait_for(Option::is_some).await.unwrap().unwrap();
        assert_eq!(code, 4);

        daemon.shutdown();
        assert!(!dir.path().join(".ipc/in").exists());
    }
}
