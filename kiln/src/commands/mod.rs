//! Kiln command-line interface
//!
//! - `build`: run the pipeline (or a single phase) of the configured package
//! - `fetch`: fetch or check distfiles
//! - `ipc`: helper build scripts call to talk to their supervisor
//! - `config`: print the effective configuration

use clap::{Parser, Subcommand};
use convenient_ebuild::{ConfigResult, KilnConfig, LockMode};
use convenient_task::{ForkStrategy, ReturnCode};
use std::path::{Path, PathBuf};

pub mod build;
pub mod config;
pub mod fetch;
pub mod ipc;

/// Kiln - supervised source package builds
#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Supervised source package builds")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Overrides applied on top of `kiln.yml`
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunOverrides {
    /// Do not echo process output; logs only
    #[arg(long)]
    pub background: bool,

    /// Maximum number of concurrent fetches
    #[arg(long)]
    pub fetch_jobs: Option<usize>,

    /// Fail instead of waiting when the build directory is locked
    #[arg(long)]
    pub no_wait: bool,

    /// How forked helpers receive their descriptors: inherit or transfer
    #[arg(long, env = "CONVENIENT_FORK_STRATEGY")]
    pub fork_strategy: Option<String>,

    /// Seconds a script may take to exit after reporting its status
    #[arg(long)]
    pub exit_timeout: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the configured package
    Build {
        /// Path to the configuration file
        #[arg(short, long, default_value = "kiln.yml")]
        config: PathBuf,

        /// Run only this phase
        #[arg(long)]
        phase: Option<String>,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Fetch the configured package's distfiles
    Fetch {
        /// Path to the configuration file
        #[arg(short, long, default_value = "kiln.yml")]
        config: PathBuf,

        /// Only check whether everything is already fetched
        #[arg(long)]
        check: bool,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Send a command to the supervising kiln (for build scripts)
    Ipc {
        /// Command and arguments, e.g. `has_version / dev-lang/perl`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the effective configuration
    Config {
        /// Path to the configuration file
        #[arg(short, long, default_value = "kiln.yml")]
        config: PathBuf,
    },
}

impl RunOverrides {
    /// Load `path` and apply the overrides
    pub async fn load(&self, path: &Path) -> ConfigResult<KilnConfig> {
        let mut config = KilnConfig::load(path).await?;
        let run = &mut config.run;
        if self.background {
            run.background = true;
        }
        if let Some(jobs) = self.fetch_jobs {
            run.max_fetch_jobs = jobs.max(1);
        }
        if self.no_wait {
            run.lock_mode = LockMode::NonBlocking;
        }
        match self.fork_strategy.as_deref() {
            Some("transfer") => run.fork_strategy = Some(ForkStrategy::Transfer),
            Some("inherit") => run.fork_strategy = Some(ForkStrategy::Inherit),
            Some(other) => tracing::warn!("Ignoring unknown fork strategy '{}'", other),
            None => {}
        }
        if let Some(secs) = self.exit_timeout {
            run.exit_timeout_secs = secs;
        }
        Ok(config)
    }
}

/// Process exit status for a task returncode
pub fn exit_status(returncode: ReturnCode) -> i32 {
    if returncode < 0 {
        128 - returncode
    } else {
        returncode
    }
}

pub async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Build {
            config,
            phase,
            overrides,
        } => build::run(&overrides.load(&config).await?, phase.as_deref()).await,
        Commands::Fetch {
            config,
            check,
            overrides,
        } => fetch::run(&overrides.load(&config).await?, check).await,
        Commands::Ipc { args } => ipc::run(&args).await,
        Commands::Config { config } => config::run(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(7), 7);
        assert_eq!(exit_status(-9), 137);
        assert_eq!(exit_status(-15), 143);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["kiln", "build", "--phase", "compile", "--no-wait"]).unwrap();
        match cli.command {
            Commands::Build {
                phase, overrides, ..
            } => {
                assert_eq!(phase.as_deref(), Some("compile"));
                assert!(overrides.no_wait);
            }
            _ => panic!("expected build"),
        }

        let cli = Cli::try_parse_from(["kiln", "ipc", "has_version", "/", ">=dev-lang/perl-5"])
            .unwrap();
        match cli.command {
            Commands::Ipc { args } => assert_eq!(args, vec!["has_version", "/", ">=dev-lang/perl-5"]),
            _ => panic!("expected ipc"),
        }
    }

    #[tokio::test]
    async fn test_overrides_apply() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kiln.yml");
        std::fs::write(&path, "package:\n  category: app-misc\n  pf: hello-1.0\n").unwrap();

        let overrides = RunOverrides {
            background: true,
            fetch_jobs: Some(0),
            no_wait: true,
            fork_strategy: Some("transfer".into()),
            exit_timeout: Some(3),
        };
        let config = overrides.load(&path).await.unwrap();
        assert!(config.run.background);
        assert_eq!(config.run.max_fetch_jobs, 1);
        assert_eq!(config.run.lock_mode, LockMode::NonBlocking);
        assert_eq!(config.run.fork_strategy, Some(ForkStrategy::Transfer));
        assert_eq!(config.run.exit_timeout_secs, 3);
    }
}
