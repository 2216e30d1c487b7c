//! Wire format of the IPC command channel
//!
//! One JSON object per line in each direction. A request names its command
//! in the `command` field:
//!
//! ```text
//! {"command":"has_version","root":"/","atom":">=dev-lang/perl-5"}
//! {"stdout":"","stderr":"","returncode":0}
//! ```

use serde::{Deserialize, Serialize};

/// Query returncode: success
pub const QUERY_OK: i32 = 0;
/// Query returncode: nothing matched
pub const QUERY_NOT_FOUND: i32 = 1;
/// Query returncode: malformed atom or repository name
pub const QUERY_INVALID_ARGUMENT: i32 = 2;
/// Query returncode: unknown root or command
pub const QUERY_INVALID_COMMAND: i32 = 3;

fn default_root() -> String {
    "/".to_string()
}

/// Commands a build script may send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcCommand {
    BestVersion {
        #[serde(default = "default_root")]
        root: String,
        atom: String,
    },
    HasVersion {
        #[serde(default = "default_root")]
        root: String,
        atom: String,
    },
    EclassPath {
        #[serde(default = "default_root")]
        root: String,
        repository: String,
        eclass: String,
    },
    LicensePath {
        #[serde(default = "default_root")]
        root: String,
        repository: String,
        license: String,
    },
    MasterRepositories {
        #[serde(default = "default_root")]
        root: String,
        repository: String,
    },
    RepositoryPath {
        #[serde(default = "default_root")]
        root: String,
        repository: String,
    },
    AvailableEclasses {
        #[serde(default = "default_root")]
        root: String,
        repository: String,
    },
    /// The script is done and reports its exit code
    Exit { code: i32 },
}

impl IpcCommand {
    /// Command name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            IpcCommand::BestVersion { .. } => "best_version",
            IpcCommand::HasVersion { .. } => "has_version",
            IpcCommand::EclassPath { .. } => "eclass_path",
            IpcCommand::LicensePath { .. } => "license_path",
            IpcCommand::MasterRepositories { .. } => "master_repositories",
            IpcCommand::RepositoryPath { .. } => "repository_path",
            IpcCommand::AvailableEclasses { .. } => "available_eclasses",
            IpcCommand::Exit { .. } => "exit",
        }
    }

    /// Build a command from helper-style arguments: `name [root] args...`
    pub fn from_args(args: &[String]) -> Option<Self> {
        let (name, rest) = args.split_first()?;
        let arg = |i: usize| rest.get(i).cloned();
        let command = match name.as_str() {
            "exit" => IpcCommand::Exit {
                code: rest.first()?.parse().ok()?,
            },
            "best_version" => IpcCommand::BestVersion {
                root: arg(0)?,
                atom: arg(1)?,
            },
            "has_version" => IpcCommand::HasVersion {
                root: arg(0)?,
                atom: arg(1)?,
            },
            "eclass_path" => IpcCommand::EclassPath {
                root: arg(0)?,
                repository: arg(1)?,
                eclass: arg(2)?,
            },
            "license_path" => IpcCommand::LicensePath {
                root: arg(0)?,
                repository: arg(1)?,
                license: arg(2)?,
            },
            "master_repositories" => IpcCommand::MasterRepositories {
                root: arg(0)?,
                repository: arg(1)?,
            },
            "repository_path" => IpcCommand::RepositoryPath {
                root: arg(0)?,
                repository: arg(1)?,
            },
            "available_eclasses" => IpcCommand::AvailableEclasses {
                root: arg(0)?,
                repository: arg(1)?,
            },
            _ => return None,
        };
        Some(command)
    }
}

/// Reply to one command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpcReply {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub returncode: i32,
}

impl IpcReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            returncode: QUERY_OK,
        }
    }

    pub fn not_found() -> Self {
        Self {
            returncode: QUERY_NOT_FOUND,
            ..Self::default()
        }
    }

    pub fn error(stderr: impl Into<String>, returncode: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            returncode,
        }
    }
}
