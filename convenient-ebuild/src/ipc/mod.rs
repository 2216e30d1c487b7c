//! Command channel between the supervisor and build scripts
//!
//! While a build-directory phase runs, the supervisor serves two FIFOs under
//! `<builddir>/.ipc`. Scripts send one request per exchange on `in` and read
//! the reply from `out`, holding an advisory lock on `lock` for the whole
//! exchange so concurrent helpers do not interleave.

pub mod client;
pub mod daemon;
pub mod protocol;

pub use client::IpcClient;
pub use daemon::IpcDaemon;
pub use protocol::{IpcCommand, IpcReply};

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Failed to create FIFO {path}: {source}")]
    Fifo {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Malformed message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("No reply within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Channel closed before a reply arrived")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub type IpcResult<T> = Result<T, IpcError>;

/// Locations of the channel files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcPaths {
    pub dir: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub lock: PathBuf,
}

impl IpcPaths {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            input: dir.join("in"),
            output: dir.join("out"),
            lock: dir.join("lock"),
            dir,
        }
    }
}
