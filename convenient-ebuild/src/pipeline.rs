//! Build pipeline of one package
//!
//! ```text
//! fetch ─▶ [lock: clean ─▶ prepare ─▶ setup … install ─▶ package? ─▶ merge]
//! ```
//!
//! Fetching happens outside the build directory lock and goes through the
//! run-wide admission queue. Everything else runs under one lock held by a
//! [`LockedStage`], so the phases see `builddir_locked` and do not lock again.

use crate::builddir::{BuildDirectoryLock, LockMode, LockRegistry, LockedStage, PrepareBuildDir};
use crate::fetcher::FetchStage;
use crate::merge::merge_task;
use crate::phase::PhaseSupervisor;
use crate::query::QueryHandler;
use crate::settings::{BuildSettings, CLEAN_PHASE, PACKAGE_PHASE};
use convenient_task::{AdmissionQueue, CompositeTask, DescriptorStrategy};
use std::sync::Arc;
use tracing::debug;

/// Default number of concurrent fetches
pub const DEFAULT_FETCH_JOBS: usize = 3;

/// State shared by every pipeline of a run
#[derive(Clone)]
pub struct BuildContext {
    pub locks: LockRegistry,
    pub lock_mode: LockMode,
    pub queries: Arc<QueryHandler>,
    pub fetch_queue: AdmissionQueue,
    pub fork_strategy: Arc<dyn DescriptorStrategy>,
}

impl BuildContext {
    pub fn new(queries: Arc<QueryHandler>, fork_strategy: Arc<dyn DescriptorStrategy>) -> Self {
        Self {
            locks: LockRegistry::new(),
            lock_mode: LockMode::Wait,
            queries,
            fetch_queue: AdmissionQueue::new("fetch", DEFAULT_FETCH_JOBS),
            fork_strategy,
        }
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    pub fn with_fetch_jobs(mut self, max_concurrent: usize) -> Self {
        self.fetch_queue = AdmissionQueue::new("fetch", max_concurrent);
        self
    }

    /// Supervisor for one phase of `settings`' package
    pub fn phase(&self, settings: Arc<BuildSettings>, phase: &str) -> PhaseSupervisor {
        PhaseSupervisor::new(
            settings,
            phase,
            self.locks.clone(),
            self.lock_mode,
            self.queries.clone(),
        )
    }

    /// Fetch stage for `settings`' package
    pub fn fetch(&self, settings: Arc<BuildSettings>) -> FetchStage {
        FetchStage::new(settings, self.fetch_queue.clone())
    }
}

/// Compose the full pipeline of one package
pub fn build_pipeline(settings: Arc<BuildSettings>, context: &BuildContext) -> CompositeTask {
    let package = settings.package.to_string();
    let locked = settings.locked();

    let mut build = CompositeTask::new(format!("{} build", package))
        .then(context.phase(locked.clone(), CLEAN_PHASE))
        .then(PrepareBuildDir::new(locked.clone()));
    for phase in &locked.build_phases {
        build = build.then(context.phase(locked.clone(), phase));
    }
    if locked.features.binpkg {
        build = build.then(context.phase(locked.clone(), PACKAGE_PHASE));
    }
    let build = build.then(merge_task(&locked, context.fork_strategy.clone()));
    debug!("{}: {} locked stages", package, build.len());

    let lock = BuildDirectoryLock::new(&settings, context.locks.clone(), context.lock_mode);
    CompositeTask::new(package.clone())
        .then(context.fetch(settings))
        .then(LockedStage::new(format!("{} locked", package), lock, build))
}
