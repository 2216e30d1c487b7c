//! Immutable build settings
//!
//! Everything a pipeline needs to know about one package build is gathered in
//! a [`BuildSettings`] before any task is created. Tasks receive it behind an
//! `Arc` and never mutate it.

use crate::fetcher::DistfileDigest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Phases that run without a build directory, lock or IPC channel
pub const PHASES_WITHOUT_BUILDDIR: &[&str] = &["clean", "cleanrm", "depend", "help"];

/// Phases that keep the caller's stdin
pub const INTERACTIVE_PHASES: &[&str] = &["config"];

/// Phases run by the build stage, in order
pub const DEFAULT_BUILD_PHASES: &[&str] =
    &["setup", "unpack", "prepare", "configure", "compile", "install"];

/// Phase producing a binary package, run when `binpkg` is enabled
pub const PACKAGE_PHASE: &str = "package";

/// Phase run before the build directory is prepared
pub const CLEAN_PHASE: &str = "clean";

/// Default grace window after a script reports its exit code over IPC
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default fetch command; `${DISTFILE}` and `${URI}` are substituted
pub const DEFAULT_FETCH_COMMAND: &str = r#"wget -t 3 -T 60 -O "${DISTFILE}" "${URI}""#;

/// Whether `phase` needs the build directory
pub fn phase_needs_builddir(phase: &str) -> bool {
    !PHASES_WITHOUT_BUILDDIR.contains(&phase)
}

/// Category and full name (name plus version) of a package
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub category: String,
    pub pf: String,
}

impl PackageId {
    pub fn new(category: impl Into<String>, pf: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            pf: pf.into(),
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.pf)
    }
}

/// Optional behaviours of the phase supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Run the IPC command channel for builddir phases
    pub ipc: bool,
    /// Put phase processes in a dedicated cgroup when running as root
    pub cgroup: bool,
    /// Run the `package` phase after the build phases
    pub binpkg: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            ipc: true,
            cgroup: false,
            binpkg: false,
        }
    }
}

/// Settings for one package build
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub package: PackageId,
    /// `<builddir root>/<category>/<pf>`
    pub builddir: PathBuf,
    pub distdir: PathBuf,
    /// Target root for the merge stage
    pub root: PathBuf,
    /// Program and arguments run for each phase; the phase name is appended
    pub phase_command: Vec<String>,
    pub build_phases: Vec<String>,
    /// Extra environment for phases
    pub env: BTreeMap<String, String>,
    pub features: Features,
    pub background: bool,
    pub log_file: Option<PathBuf>,
    /// The package asks for an interactive stdin in every phase
    pub interactive: bool,
    pub exit_timeout: Duration,
    pub cancel_timeout: Duration,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// An enclosing stage already holds the build directory lock
    pub builddir_locked: bool,
    pub cgroup_root: PathBuf,
    pub fetch_command: String,
    pub distfiles: Vec<DistfileDigest>,
}

impl BuildSettings {
    /// Settings with defaults for `package` built under `builddir_root`
    pub fn new(package: PackageId, builddir_root: impl AsRef<Path>) -> Self {
        let builddir = builddir_root
            .as_ref()
            .join(&package.category)
            .join(&package.pf);
        Self {
            package,
            builddir,
            distdir: PathBuf::from("/var/cache/distfiles"),
            root: PathBuf::from("/"),
            phase_command: vec!["/bin/sh".to_string(), "build.sh".to_string()],
            build_phases: DEFAULT_BUILD_PHASES.iter().map(|p| p.to_string()).collect(),
            env: BTreeMap::new(),
            features: Features::default(),
            background: false,
            log_file: None,
            interactive: false,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
            cancel_timeout: convenient_task::process::DEFAULT_CANCEL_TIMEOUT,
            uid: None,
            gid: None,
            builddir_locked: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            fetch_command: DEFAULT_FETCH_COMMAND.to_string(),
            distfiles: Vec::new(),
        }
    }

    /// Freeze the settings for sharing between tasks
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// A copy marked as running under an already held build directory lock
    pub fn locked(&self) -> Arc<Self> {
        Arc::new(Self {
            builddir_locked: true,
            ..self.clone()
        })
    }

    pub fn workdir(&self) -> PathBuf {
        self.builddir.join("work")
    }

    /// Per-build temporary directory (`T`)
    pub fn tempdir(&self) -> PathBuf {
        self.builddir.join("temp")
    }

    /// Image directory (`D`) the install phase fills and merge copies
    pub fn imagedir(&self) -> PathBuf {
        self.builddir.join("image")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.builddir.join(".ipc")
    }

    pub fn exit_file(&self) -> PathBuf {
        self.builddir.join(".exit_status")
    }

    /// Sibling lock file `<builddir>.lock`
    pub fn lock_file(&self) -> PathBuf {
        let mut name = self.builddir.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Whether `phase` keeps an interactive stdin
    pub fn phase_is_interactive(&self, phase: &str) -> bool {
        self.interactive || INTERACTIVE_PHASES.contains(&phase)
    }

    /// Environment for `phase`, without the liveness channel variables
    pub fn phase_env(&self, phase: &str) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        let path = |p: &Path| p.display().to_string();
        env.insert("KILN_PHASE".into(), phase.to_string());
        env.insert("KILN_CATEGORY".into(), self.package.category.clone());
        env.insert("KILN_PF".into(), self.package.pf.clone());
        env.insert("KILN_BUILDDIR".into(), path(&self.builddir));
        env.insert("KILN_WORKDIR".into(), path(&self.workdir()));
        env.insert("KILN_T".into(), path(&self.tempdir()));
        env.insert("KILN_D".into(), path(&self.imagedir()));
        env.insert("KILN_DISTDIR".into(), path(&self.distdir));
        env.insert("KILN_ROOT".into(), path(&self.root));
        if self.background {
            env.insert("NOCOLOR".into(), "true".into());
        }
        env
    }
}
