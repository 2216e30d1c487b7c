//! Package build supervision for Kiln
//!
//! Builds on [`convenient_task`] to run the phases of a source package:
//!
//! - [`BuildSettings`]: everything one package build needs, frozen up front
//! - [`BuildDirectoryLock`]: per-package exclusion over the build directory
//! - [`ipc`]: the command channel build scripts use to query the package
//!   database and report their exit code
//! - [`PhaseSupervisor`]: one supervised phase, with grace-then-kill exit
//!   handling and abnormal termination reports
//! - [`FetchStage`]: distfile download through the run-wide admission queue
//! - [`build_pipeline`]: fetch, clean, build and merge as one task
//!
//! Binaries using [`merge_task`] must call
//! [`convenient_task::child_main`] with [`entry_points`] first thing in
//! `main` when the transfer fork strategy is in use.

pub mod builddir;
pub mod cgroup;
pub mod config;
pub mod fetcher;
pub mod ipc;
pub mod merge;
pub mod phase;
pub mod pipeline;
pub mod query;
pub mod settings;

pub use builddir::{
    BuildDirectoryLock, LockError, LockMode, LockRegistry, LockResult, LockedStage, PendingResult,
    PrepareBuildDir,
};
pub use cgroup::CgroupIsolation;
pub use config::{ConfigError, ConfigResult, KilnConfig};
pub use fetcher::{DistfileDigest, FetchDistfiles, FetchError, FetchStage, already_fetched};
pub use ipc::{IpcClient, IpcCommand, IpcDaemon, IpcError, IpcPaths, IpcReply};
pub use merge::{MERGE_ENTRY, entry_points, merge_task};
pub use phase::{LivenessChannel, PhaseSupervisor};
pub use pipeline::{BuildContext, build_pipeline};
pub use query::{
    PackageDatabase, QueryError, QueryHandler, RepositoryInfo, StaticPackageDatabase,
};
pub use settings::{BuildSettings, Features, PackageId};
