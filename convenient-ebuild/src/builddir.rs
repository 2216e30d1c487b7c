//! Build directory locking
//!
//! A build directory belongs to one package build at a time. Exclusion is
//! two-level:
//!
//! - in-process, through a shared [`LockRegistry`] of FIFO-fair async mutexes
//! - between processes, through an advisory `flock` on `<builddir>.lock`
//!
//! Directory creation and the blocking `flock` call run on the blocking
//! pool so acquisition never stalls the runtime.

use crate::settings::BuildSettings;
use async_trait::async_trait;
use convenient_task::{CANCELLED_RETURNCODE, CancelSignal, EX_OK, ReturnCode, Task, TaskHandle};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{AccessFlags, access};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Cannot create build directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Build directory is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("Build directory is locked by another build: {0}")]
    AlreadyLocked(PathBuf),

    #[error("Build directory lock is already held by this handle: {0}")]
    AlreadyHeld(PathBuf),

    #[error("Unlock already in progress for {0}")]
    UnlockInProgress(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// How to react to a build directory that is already locked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Queue behind the current holder
    #[default]
    Wait,
    /// Fail with [`LockError::AlreadyLocked`]
    NonBlocking,
}

/// In-process lock table shared by every build in a run
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the entry for `path` unless a holder or waiter still uses it
    fn prune(&self, path: &Path) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(path)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(path);
        }
    }

    /// Number of build directories currently tracked
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum LockState {
    Unlocked,
    Locked {
        guard: OwnedMutexGuard<()>,
        flock: Flock<File>,
    },
    Unlocking,
}

/// Lease over one build directory
#[derive(Clone)]
pub struct BuildDirectoryLock {
    builddir: PathBuf,
    lock_file: PathBuf,
    registry: LockRegistry,
    mode: LockMode,
    state: Arc<Mutex<LockState>>,
}

impl std::fmt::Debug for BuildDirectoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildDirectoryLock")
            .field("builddir", &self.builddir)
            .field("mode", &self.mode)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl BuildDirectoryLock {
    pub fn new(settings: &BuildSettings, registry: LockRegistry, mode: LockMode) -> Self {
        Self {
            builddir: settings.builddir.clone(),
            lock_file: settings.lock_file(),
            registry,
            mode,
            state: Arc::new(Mutex::new(LockState::Unlocked)),
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.builddir
    }

    pub fn is_locked(&self) -> bool {
        matches!(*self.state(), LockState::Locked { .. })
    }

    /// Acquire the lock, creating the build directory if needed.
    ///
    /// Resolves once the lock is held. Dropping the future before that
    /// leaves the directory unlocked.
    pub async fn acquire(&self) -> LockResult<()> {
        if !matches!(*self.state(), LockState::Unlocked) {
            return Err(LockError::AlreadyHeld(self.builddir.clone()));
        }

        let builddir = self.builddir.clone();
        tokio::task::spawn_blocking(move || create_writable_dir(&builddir))
            .await
            .map_err(|e| LockError::Io(io::Error::other(e)))??;

        let mutex = self.registry.entry(&self.builddir);
        let guard = match self.mode {
            LockMode::Wait => Ok(mutex.lock_owned().await),
            LockMode::NonBlocking => mutex
                .try_lock_owned()
                .map_err(|_| LockError::AlreadyLocked(self.builddir.clone())),
        };
        let locked = match guard {
            Ok(guard) => self.flock().await.map(|flock| (guard, flock)),
            Err(e) => Err(e),
        };
        let (guard, flock) = match locked {
            Ok(locked) => locked,
            Err(e) => {
                self.registry.prune(&self.builddir);
                return Err(e);
            }
        };

        let mut state = self.state();
        if !matches!(*state, LockState::Unlocked) {
            return Err(LockError::AlreadyHeld(self.builddir.clone()));
        }
        *state = LockState::Locked { guard, flock };
        debug!("Locked build directory {}", self.builddir.display());
        Ok(())
    }

    async fn flock(&self) -> LockResult<Flock<File>> {
        let lock_file = self.lock_file.clone();
        let mode = self.mode;
        tokio::task::spawn_blocking(move || lock_path(&lock_file, mode))
            .await
            .map_err(|e| LockError::Io(io::Error::other(e)))?
            .map_err(|e| match e {
                LockError::Nix(Errno::EWOULDBLOCK) => {
                    LockError::AlreadyLocked(self.builddir.clone())
                }
                other => other,
            })
    }

    /// Release the lock. Idempotent.
    ///
    /// The lock file is removed while still held, then the category
    /// directory is removed if it became empty.
    pub async fn release(&self) -> LockResult<()> {
        let (guard, flock) = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, LockState::Unlocking) {
                LockState::Locked { guard, flock } => (guard, flock),
                LockState::Unlocked => {
                    *state = LockState::Unlocked;
                    return Ok(());
                }
                LockState::Unlocking => {
                    return Err(LockError::UnlockInProgress(self.builddir.clone()));
                }
            }
        };

        let lock_file = self.lock_file.clone();
        let builddir = self.builddir.clone();
        let result = tokio::task::spawn_blocking(move || {
            let removed = fs::remove_file(&lock_file);
            drop(flock);
            if let Some(parent) = builddir.parent() {
                // Fails harmlessly while other packages share the category.
                let _ = fs::remove_dir(parent);
            }
            removed
        })
        .await;
        drop(guard);
        self.registry.prune(&self.builddir);
        *self.state() = LockState::Unlocked;

        match result {
            Ok(Ok(())) => {
                debug!("Unlocked build directory {}", self.builddir.display());
                Ok(())
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Ok(Err(e)) => Err(LockError::Io(e)),
            Err(e) => Err(LockError::Io(io::Error::other(e))),
        }
    }

    /// Release, then publish the returncode held in `pending`.
    ///
    /// A failed unlock turns a success into a failure.
    pub async fn release_with_result(&self, pending: PendingResult) -> ReturnCode {
        match self.release().await {
            Ok(()) => pending.publish(),
            Err(e) => {
                error!("Failed to unlock {}: {}", self.builddir.display(), e);
                match pending.publish() {
                    EX_OK => 1,
                    code => code,
                }
            }
        }
    }
}

fn create_writable_dir(path: &Path) -> LockResult<()> {
    fs::create_dir_all(path).map_err(|e| LockError::CreateDir {
        path: path.to_path_buf(),
        source: e,
    })?;
    if access(path, AccessFlags::W_OK).is_err() {
        return Err(LockError::NotWritable(path.to_path_buf()));
    }
    Ok(())
}

/// Open and flock `path`, retrying when the file was replaced underneath us
fn lock_path(path: &Path, mode: LockMode) -> LockResult<Flock<File>> {
    let arg = match mode {
        LockMode::Wait => FlockArg::LockExclusive,
        LockMode::NonBlocking => FlockArg::LockExclusiveNonblock,
    };
    loop {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let flock = Flock::lock(file, arg).map_err(|(_, errno)| LockError::Nix(errno))?;

        // The previous holder unlinks the file before unlocking; a lock on
        // an unlinked inode excludes nobody.
        let held = flock.metadata()?;
        match fs::metadata(path) {
            Ok(current) if current.ino() == held.ino() && current.dev() == held.dev() => {
                return Ok(flock);
            }
            _ => continue,
        }
    }
}

/// A returncode recorded before the lock is released and published after.
///
/// Readers polling [`PendingResult::returncode`] see nothing until the
/// unlock has completed.
#[derive(Debug)]
pub struct PendingResult {
    returncode: ReturnCode,
    published: bool,
}

impl PendingResult {
    /// Hold `returncode` privately
    pub fn hold(returncode: ReturnCode) -> Self {
        Self {
            returncode,
            published: false,
        }
    }

    /// The published value, `None` while pending
    pub fn returncode(&self) -> Option<ReturnCode> {
        self.published.then_some(self.returncode)
    }

    /// Publish and return the held value
    pub fn publish(mut self) -> ReturnCode {
        self.published = true;
        self.returncode
    }
}

/// Runs an inner task while holding the build directory lock
pub struct LockedStage {
    name: String,
    lock: BuildDirectoryLock,
    inner: Option<Box<dyn Task>>,
}

impl LockedStage {
    pub fn new(name: impl Into<String>, lock: BuildDirectoryLock, inner: impl Task) -> Self {
        Self {
            name: name.into(),
            lock,
            inner: Some(Box::new(inner)),
        }
    }
}

#[async_trait]
impl Task for LockedStage {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        let Some(inner) = self.inner.take() else {
            return CANCELLED_RETURNCODE;
        };

        tokio::select! {
            acquired = self.lock.acquire() => {
                if let Err(e) = acquired {
                    error!("{}: {}", self.name, e);
                    return 1;
                }
            }
            _ = cancel.cancelled() => {
                info!("{}: cancelled while waiting for the build directory lock", self.name);
                return CANCELLED_RETURNCODE;
            }
        }

        let handle = TaskHandle::from_boxed(inner);
        let returncode = match handle.start() {
            Ok(()) => {
                let result = tokio::select! {
                    result = handle.wait() => result,
                    _ = cancel.cancelled() => {
                        handle.cancel();
                        handle.wait().await
                    }
                };
                result.unwrap_or_else(|e| {
                    warn!("{}: {}", self.name, e);
                    1
                })
            }
            Err(e) => {
                warn!("{}: {}", self.name, e);
                1
            }
        };

        self.lock
            .release_with_result(PendingResult::hold(returncode))
            .await
    }
}

/// Creates the standard subdirectories of a build directory
pub struct PrepareBuildDir {
    settings: Arc<BuildSettings>,
}

impl PrepareBuildDir {
    pub fn new(settings: Arc<BuildSettings>) -> Self {
        Self { settings }
    }

    pub fn prepare(settings: &BuildSettings) -> io::Result<()> {
        for dir in [
            settings.workdir(),
            settings.tempdir(),
            settings.imagedir(),
            settings.ipc_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Task for PrepareBuildDir {
    fn name(&self) -> String {
        format!("{} prepare-builddir", self.settings.package)
    }

    async fn run(&mut self, _cancel: CancelSignal) -> ReturnCode {
        let settings = Arc::clone(&self.settings);
        let prepared = tokio::task::spawn_blocking(move || Self::prepare(&settings))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));
        match prepared {
            Ok(()) => EX_OK,
            Err(e) => {
                error!(
                    package = %self.settings.package,
                    "Failed to prepare {}: {}", self.settings.builddir.display(), e
                );
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PackageId;
    use convenient_task::FutureTask;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(root: &Path) -> BuildSettings {
        BuildSettings::new(PackageId::new("app-misc", "hello-1.0"), root)
    }

    #[tokio::test]
    async fn test_acquire_creates_dir_and_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let lock = BuildDirectoryLock::new(&settings, LockRegistry::new(), LockMode::Wait);

        lock.acquire().await.unwrap();
        assert!(lock.is_locked());
        assert!(settings.builddir.is_dir());
        assert!(settings.lock_file().exists());

        lock.release().await.unwrap();
        lock.release().await.unwrap();
        assert!(!lock.is_locked());
        assert!(!settings.lock_file().exists());
    }

    #[tokio::test]
    async fn test_second_acquirer_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let registry = LockRegistry::new();
        let first = BuildDirectoryLock::new(&settings, registry.clone(), LockMode::Wait);
        let second = BuildDirectoryLock::new(&settings, registry, LockMode::Wait);

        first.acquire().await.unwrap();
        let waiter = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert!(!second.is_locked());

        first.release().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(second.is_locked());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_blocking_mode_fails_when_held() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let registry = LockRegistry::new();
        let first = BuildDirectoryLock::new(&settings, registry.clone(), LockMode::Wait);
        let second = BuildDirectoryLock::new(&settings, registry, LockMode::NonBlocking);

        first.acquire().await.unwrap();
        assert!(matches!(
            second.acquire().await,
            Err(LockError::AlreadyLocked(_))
        ));
        first.release().await.unwrap();
        second.acquire().await.unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_flock_excludes_other_registries() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let first = BuildDirectoryLock::new(&settings, LockRegistry::new(), LockMode::Wait);
        let second = BuildDirectoryLock::new(&settings, LockRegistry::new(), LockMode::NonBlocking);

        first.acquire().await.unwrap();
        assert!(matches!(
            second.acquire().await,
            Err(LockError::AlreadyLocked(_))
        ));
        first.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_unwritable_parent_is_lock_error() {
        let settings = BuildSettings::new(
            PackageId::new("app-misc", "hello-1.0"),
            "/proc/kiln-does-not-exist",
        );
        let lock = BuildDirectoryLock::new(&settings, LockRegistry::new(), LockMode::Wait);
        assert!(matches!(
            lock.acquire().await,
            Err(LockError::CreateDir { .. })
        ));
    }

    #[test]
    fn test_pending_result_is_hidden_until_published() {
        let pending = PendingResult::hold(3);
        assert_eq!(pending.returncode(), None);
        assert_eq!(pending.publish(), 3);
    }

    #[tokio::test]
    async fn test_release_with_result_publishes_after_unlock() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let lock = BuildDirectoryLock::new(&settings, LockRegistry::new(), LockMode::Wait);
        lock.acquire().await.unwrap();

        let code = lock.release_with_result(PendingResult::hold(4)).await;
        assert_eq!(code, 4);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_locked_stage_holds_lock_during_inner_task() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let registry = LockRegistry::new();
        let stage_lock = BuildDirectoryLock::new(&settings, registry.clone(), LockMode::Wait);
        let contender = BuildDirectoryLock::new(&settings, registry, LockMode::NonBlocking);

        let observed = Arc::new(Mutex::new(None));
        let inner = {
            let observed = observed.clone();
            let contender = contender.clone();
            FutureTask::new("inner", async move {
                let busy = matches!(contender.acquire().await, Err(LockError::AlreadyLocked(_)));
                *observed.lock().unwrap() = Some(busy);
                5
            })
        };

        let handle = TaskHandle::spawn(LockedStage::new("locked", stage_lock.clone(), inner));
        assert_eq!(handle.wait().await.unwrap(), 5);
        assert_eq!(*observed.lock().unwrap(), Some(true));
        assert!(!stage_lock.is_locked());
    }

    #[tokio::test]
    async fn test_registry_forgets_released_directories() {
        let dir = TempDir::new().unwrap();
        let registry = LockRegistry::new();

        for pf in ["hello-1.0", "hello-1.1", "world-2.0"] {
            let settings = BuildSettings::new(PackageId::new("app-misc", pf), dir.path());
            let lock = BuildDirectoryLock::new(&settings, registry.clone(), LockMode::Wait);
            lock.acquire().await.unwrap();
            assert_eq!(registry.len(), 1);
            lock.release().await.unwrap();
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_keeps_entry_while_waiters_queue() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let registry = LockRegistry::new();
        let first = BuildDirectoryLock::new(&settings, registry.clone(), LockMode::Wait);
        let second = BuildDirectoryLock::new(&settings, registry.clone(), LockMode::Wait);

        first.acquire().await.unwrap();
        let waiter = {
            let second = second.clone();
            tokio::spawn(async move { second.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        first.release().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(registry.len(), 1);

        second.release().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_non_blocking_acquire_leaves_no_entry() {
        let dir = TempDir::new().unwrap();
        let settings = settings(dir.path());
        let holder = BuildDirectoryLock::new(&settings, LockRegistry::new(), LockMode::Wait);
        let registry = LockRegistry::new();
        let contender = BuildDirectoryLock::new(&settings, registry.clone(), LockMode::NonBlocking);

        holder.acquire().await.unwrap();
        assert!(contender.acquire().await.is_err());
        assert!(registry.is_empty());
        holder.release().await.unwrap();
    }
}
