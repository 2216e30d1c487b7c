//! Distfile fetching
//!
//! A package lists its source archives as [`DistfileDigest`]s. The
//! [`FetchStage`] first checks the distfile directory quietly; only when
//! something is missing or broken does it queue a [`FetchDistfiles`] task in
//! the run-wide [`AdmissionQueue`], which downloads each file with the
//! configured fetch command and verifies it.

use crate::settings::BuildSettings;
use async_trait::async_trait;
use convenient_task::process::supervise;
use convenient_task::{
    AdmissionQueue, CANCELLED_RETURNCODE, CancelSignal, EX_OK, ProcessTask, ReturnCode, Task,
    TaskHandle,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{name}: file not found")]
    Missing { name: String },

    #[error("{name}: size is {actual}, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("{name}: sha256 is {actual}, expected {expected}")]
    DigestMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("{name}: no URI to fetch from")]
    NoUri { name: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Expected properties of one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistfileDigest {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub uris: Vec<String>,
}

impl DistfileDigest {
    pub fn path(&self, distdir: &Path) -> PathBuf {
        distdir.join(&self.name)
    }

    /// Check the file in `distdir` against size and, when known, sha256.
    ///
    /// Hashes the whole file on the blocking pool.
    pub async fn verify(&self, distdir: &Path) -> FetchResult<()> {
        let distfile = self.clone();
        let distdir = distdir.to_path_buf();
        tokio::task::spawn_blocking(move || distfile.verify_blocking(&distdir))
            .await
            .map_err(|e| FetchError::Io(io::Error::other(e)))?
    }

    /// Blocking form of [`DistfileDigest::verify`]
    pub fn verify_blocking(&self, distdir: &Path) -> FetchResult<()> {
        let path = self.path(distdir);
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                return Err(FetchError::Missing {
                    name: self.name.clone(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::Missing {
                    name: self.name.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if metadata.len() != self.size {
            return Err(FetchError::SizeMismatch {
                name: self.name.clone(),
                expected: self.size,
                actual: metadata.len(),
            });
        }

        if let Some(expected) = &self.sha256 {
            let actual = sha256_file(&path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FetchError::DigestMismatch {
                    name: self.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Hex sha256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether every distfile is present and valid.
///
/// Read-only and silent: a `false` here is not an error.
pub async fn already_fetched(distdir: &Path, distfiles: &[DistfileDigest]) -> bool {
    if distfiles.is_empty() {
        return true;
    }
    let distdir = distdir.to_path_buf();
    let distfiles = distfiles.to_vec();
    tokio::task::spawn_blocking(move || {
        distfiles
            .iter()
            .all(|d| d.verify_blocking(&distdir).is_ok())
    })
    .await
    .unwrap_or(false)
}

/// Downloads and verifies the distfiles of one package
pub struct FetchDistfiles {
    settings: Arc<BuildSettings>,
}

impl FetchDistfiles {
    pub fn new(settings: Arc<BuildSettings>) -> Self {
        Self { settings }
    }

    /// Try each URI of `distfile` until one yields a valid file
    async fn fetch_one(
        &self,
        distfile: &DistfileDigest,
        cancel: &mut CancelSignal,
    ) -> Result<(), Option<ReturnCode>> {
        let settings = &self.settings;
        let target = distfile.path(&settings.distdir);

        for uri in &distfile.uris {
            info!(package = %settings.package, "Fetching {} from {}", distfile.name, uri);

            let mut task = ProcessTask::command(
                format!("fetch {}", distfile.name),
                ["/bin/sh", "-c", settings.fetch_command.as_str()],
            );
            let spec = task.spec_mut();
            spec.env.insert("DISTFILE".into(), target.display().to_string());
            spec.env.insert("URI".into(), uri.clone());
            spec.cwd = Some(settings.distdir.clone());
            spec.background = settings.background;
            spec.log_path = settings.log_file.clone();
            spec.cancel_timeout = settings.cancel_timeout;

            if cancel.is_cancelled() {
                return Err(Some(CANCELLED_RETURNCODE));
            }
            let mut running = match task.launch() {
                Ok(running) => running,
                Err(e) => {
                    warn!("{}: {}", distfile.name, e);
                    continue;
                }
            };
            let returncode = supervise(&mut running, cancel, settings.cancel_timeout).await;
            if cancel.is_cancelled() {
                return Err(Some(returncode));
            }
            if returncode != EX_OK {
                warn!("Fetch of {} from {} failed with {}", distfile.name, uri, returncode);
                continue;
            }

            match distfile.verify(&settings.distdir).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Fetched file rejected: {}", e);
                    if let Err(e) = tokio::fs::remove_file(&target).await {
                        debug!("Failed to remove {}: {}", target.display(), e);
                    }
                }
            }
        }
        Err(None)
    }
}

#[async_trait]
impl Task for FetchDistfiles {
    fn name(&self) -> String {
        format!("{} fetch", self.settings.package)
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        let settings = Arc::clone(&self.settings);
        if let Err(e) = tokio::fs::create_dir_all(&settings.distdir).await {
            error!(
                package = %settings.package,
                "Cannot create {}: {}", settings.distdir.display(), e
            );
            return 1;
        }

        let mut failures = Vec::new();
        for distfile in &settings.distfiles {
            if distfile.verify(&settings.distdir).await.is_ok() {
                debug!("{} already fetched", distfile.name);
                continue;
            }
            if distfile.uris.is_empty() {
                failures.push(FetchError::NoUri {
                    name: distfile.name.clone(),
                });
                continue;
            }
            match self.fetch_one(distfile, &mut cancel).await {
                Ok(()) => {}
                Err(Some(returncode)) => return returncode,
                Err(None) => {
                    if let Err(e) = distfile.verify(&settings.distdir).await {
                        failures.push(e);
                    }
                }
            }
        }

        if failures.is_empty() {
            return EX_OK;
        }
        error!(
            package = %settings.package,
            "Fetch failed for {} file(s)", failures.len()
        );
        for failure in &failures {
            error!(package = %settings.package, "  {}", failure);
        }
        1
    }
}

/// Fetch step of a pipeline, admitted through the fetch queue
pub struct FetchStage {
    settings: Arc<BuildSettings>,
    queue: AdmissionQueue,
}

impl FetchStage {
    pub fn new(settings: Arc<BuildSettings>, queue: AdmissionQueue) -> Self {
        Self { settings, queue }
    }
}

#[async_trait]
impl Task for FetchStage {
    fn name(&self) -> String {
        format!("{} fetch-stage", self.settings.package)
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        if already_fetched(&self.settings.distdir, &self.settings.distfiles).await {
            debug!("{}: all distfiles present", self.settings.package);
            return EX_OK;
        }

        let handle = TaskHandle::new(FetchDistfiles::new(Arc::clone(&self.settings)));
        let (tx, rx) = oneshot::channel();
        handle.add_exit_listener(move |task| {
            let _ = tx.send(task.poll());
        });
        self.queue.schedule(handle.clone());

        let done = tokio::select! {
            done = rx => done,
            _ = cancel.cancelled() => {
                handle.cancel();
                return match handle.wait().await {
                    Ok(returncode) => returncode,
                    Err(_) => CANCELLED_RETURNCODE,
                };
            }
        };
        match done {
            Ok(Some(returncode)) => returncode,
            _ => CANCELLED_RETURNCODE,
        }
    }
}
