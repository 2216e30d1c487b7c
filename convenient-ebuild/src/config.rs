//! `kiln.yml` configuration
//!
//! ```yaml
//! run:
//!   max_fetch_jobs: 3
//!   lock_mode: wait
//!   exit_timeout_secs: 10
//!   features:
//!     cgroup: false
//! package:
//!   category: app-misc
//!   pf: hello-1.0
//!   builddir_root: /var/tmp/kiln
//!   phase_command: ["/bin/sh", "build.sh"]
//! database:
//!   roots:
//!     /:
//!       installed: ["dev-lang/perl-5.38.2"]
//! ```
//!
//! The file is read once and turned into an immutable [`BuildSettings`].

use crate::builddir::LockMode;
use crate::fetcher::DistfileDigest;
use crate::pipeline::DEFAULT_FETCH_JOBS;
use crate::query::{DatabaseConfig, StaticPackageDatabase};
use crate::settings::{
    BuildSettings, DEFAULT_BUILD_PHASES, DEFAULT_EXIT_TIMEOUT, DEFAULT_FETCH_COMMAND, Features,
    PackageId,
};
use convenient_task::ForkStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {0}: {1}")]
    Io(PathBuf, String),

    #[error("Parse error in {0}: {1}")]
    Parse(PathBuf, String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_fetch_jobs() -> usize {
    DEFAULT_FETCH_JOBS
}

fn default_exit_timeout() -> u64 {
    DEFAULT_EXIT_TIMEOUT.as_secs()
}

fn default_cancel_timeout() -> u64 {
    convenient_task::process::DEFAULT_CANCEL_TIMEOUT.as_secs()
}

fn default_fetch_command() -> String {
    DEFAULT_FETCH_COMMAND.to_string()
}

/// Settings for the whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_fetch_jobs")]
    pub max_fetch_jobs: usize,
    #[serde(default)]
    pub lock_mode: LockMode,
    #[serde(default = "default_exit_timeout")]
    pub exit_timeout_secs: u64,
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_secs: u64,
    #[serde(default)]
    pub background: bool,
    /// Unset means chosen from the environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_strategy: Option<ForkStrategy>,
    #[serde(default)]
    pub features: Features,
    /// Package logs go to `<log_dir>/<category>:<pf>.log`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_fetch_command")]
    pub fetch_command: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_fetch_jobs: default_fetch_jobs(),
            lock_mode: LockMode::default(),
            exit_timeout_secs: default_exit_timeout(),
            cancel_timeout_secs: default_cancel_timeout(),
            background: false,
            fork_strategy: None,
            features: Features::default(),
            log_dir: None,
            fetch_command: default_fetch_command(),
        }
    }
}

impl RunConfig {
    pub fn fork_strategy(&self) -> ForkStrategy {
        self.fork_strategy.unwrap_or_else(ForkStrategy::detect)
    }
}

fn default_builddir_root() -> PathBuf {
    PathBuf::from("/var/tmp/kiln")
}

fn default_distdir() -> PathBuf {
    PathBuf::from("/var/cache/distfiles")
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_phase_command() -> Vec<String> {
    vec!["/bin/sh".to_string(), "build.sh".to_string()]
}

fn default_phases() -> Vec<String> {
    DEFAULT_BUILD_PHASES.iter().map(|p| p.to_string()).collect()
}

/// The package to build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub category: String,
    pub pf: String,
    #[serde(default = "default_builddir_root")]
    pub builddir_root: PathBuf,
    #[serde(default = "default_distdir")]
    pub distdir: PathBuf,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_phase_command")]
    pub phase_command: Vec<String>,
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub distfiles: Vec<DistfileDigest>,
}

/// Contents of `kiln.yml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub run: RunConfig,
    pub package: PackageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl KilnConfig {
    pub async fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content, path)
    }

    /// Parse YAML; `origin` only labels errors
    pub fn parse(content: &str, origin: &Path) -> ConfigResult<Self> {
        let config: KilnConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(origin.to_path_buf(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        let package = &self.package;
        for (field, value) in [("category", &package.category), ("pf", &package.pf)] {
            if value.is_empty() || value.contains('/') || value.starts_with('.') {
                return Err(ConfigError::Invalid(format!(
                    "package.{} {:?} is not a valid name",
                    field, value
                )));
            }
        }
        if package.phase_command.is_empty() {
            return Err(ConfigError::Invalid(
                "package.phase_command must not be empty".to_string(),
            ));
        }
        if self.run.max_fetch_jobs == 0 {
            return Err(ConfigError::Invalid(
                "run.max_fetch_jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for the configured package
    pub fn build_settings(&self) -> BuildSettings {
        let package = &self.package;
        let id = PackageId::new(&package.category, &package.pf);
        let log_file = self
            .run
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}:{}.log", id.category, id.pf)));

        let mut settings = BuildSettings::new(id, &package.builddir_root);
        settings.distdir = package.distdir.clone();
        settings.root = package.root.clone();
        settings.phase_command = package.phase_command.clone();
        settings.build_phases = package.phases.clone();
        settings.env = package.env.clone();
        settings.interactive = package.interactive;
        settings.distfiles = package.distfiles.clone();
        settings.features = self.run.features.clone();
        settings.background = self.run.background;
        settings.log_file = log_file;
        settings.exit_timeout = Duration::from_secs(self.run.exit_timeout_secs);
        settings.cancel_timeout = Duration::from_secs(self.run.cancel_timeout_secs);
        settings.fetch_command = self.run.fetch_command.clone();
        settings
    }

    pub fn database(&self) -> StaticPackageDatabase {
        StaticPackageDatabase::from_config(self.database.clone())
    }
}
