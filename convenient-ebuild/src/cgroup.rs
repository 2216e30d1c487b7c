//! Best-effort cgroup v2 isolation of phase processes
//!
//! When enabled, each builddir phase gets its own cgroup
//! `<cgroup_root>/kiln/<category>:<pf>.<random>`. It is created before the
//! phase process starts and the child joins it ahead of exec, so nothing it
//! forks can escape. Killing every pid listed in it catches daemons a build
//! script leaves behind. When the cgroup cannot be created the phase just
//! runs without isolation.

use crate::settings::{BuildSettings, PackageId};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, geteuid};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const KILL_ROUNDS: usize = 8;
const KILL_ROUND_PAUSE: Duration = Duration::from_millis(20);

/// A cgroup owned by one phase
#[derive(Debug)]
pub struct CgroupIsolation {
    path: PathBuf,
}

impl CgroupIsolation {
    /// Create the cgroup if isolation applies to this run.
    ///
    /// Needs root, Linux and the `cgroup` feature; returns `None` otherwise
    /// or when the hierarchy is not usable.
    pub fn for_phase(settings: &BuildSettings) -> Option<Self> {
        if !settings.features.cgroup || !cfg!(target_os = "linux") || !geteuid().is_root() {
            return None;
        }
        match Self::create_in(&settings.cgroup_root, &settings.package) {
            Ok(cgroup) => Some(cgroup),
            Err(e) => {
                debug!(package = %settings.package, "cgroup isolation unavailable: {}", e);
                None
            }
        }
    }

    /// Create a fresh cgroup for `package` under `root/kiln`
    pub fn create_in(root: &Path, package: &PackageId) -> io::Result<Self> {
        let parent = root.join("kiln");
        fs::create_dir_all(&parent)?;
        let path = parent.join(format!(
            "{}:{}.{:08x}",
            package.category,
            package.pf,
            rand::random::<u32>()
        ));
        fs::create_dir(&path)?;
        debug!("Created cgroup {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File a process writes its pid to in order to join
    pub fn procs_file(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// Pids currently in the cgroup
    pub fn pids(&self) -> Vec<Pid> {
        fs::read_to_string(self.procs_file())
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| line.trim().parse::<i32>().ok())
                    .map(Pid::from_raw)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// SIGKILL everything in the cgroup, repeating while pids remain
    pub async fn kill_all(&self) {
        for _ in 0..KILL_ROUNDS {
            let pids = self.pids();
            if pids.is_empty() {
                return;
            }
            for pid in pids {
                if let Err(e) = kill(pid, Signal::SIGKILL) {
                    debug!("Failed to kill {} in {}: {}", pid, self.path.display(), e);
                }
            }
            tokio::time::sleep(KILL_ROUND_PAUSE).await;
        }
    }

    /// Kill the remaining processes and remove the cgroup
    pub async fn teardown(self) {
        self.kill_all().await;
        if let Err(e) = fs::remove_dir(&self.path) {
            debug!("Failed to remove cgroup {}: {}", self.path.display(), e);
        }
    }
}
