//! Package database queries served to build scripts
//!
//! Build scripts ask the supervisor about installed packages and
//! repositories through the IPC channel. The answers come from a
//! [`PackageDatabase`]; [`StaticPackageDatabase`] is an in-memory
//! implementation loaded from YAML.
//!
//! Atom matching here covers the operators build scripts use
//! (`=`, `~`, `<`, `<=`, `>`, `>=`, trailing `*`) and version ordering
//! with the usual `_alpha`/`_beta`/`_pre`/`_rc`/`_p` suffixes. Full
//! dependency semantics belong to the resolver.

use crate::ipc::protocol::{
    IpcCommand, IpcReply, QUERY_INVALID_ARGUMENT, QUERY_INVALID_COMMAND,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid atom: {0}")]
    InvalidAtom(String),

    #[error("Invalid database description: {0}")]
    Parse(#[from] serde_yaml::Error),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// A package repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub location: PathBuf,
    /// Names of master repositories, nearest last
    #[serde(default)]
    pub masters: Vec<String>,
    /// Eclass name to file
    #[serde(default)]
    pub eclasses: BTreeMap<String, PathBuf>,
}

/// Read access to installed packages and repositories
pub trait PackageDatabase: Send + Sync {
    /// Whether `root` (normalized, with trailing slash) is known
    fn has_root(&self, root: &str) -> bool;

    /// Installed `category/name-version` strings under `root`
    fn installed(&self, root: &str) -> Vec<String>;

    fn repository(&self, name: &str) -> Option<RepositoryInfo>;
}

/// Normalize a root to its canonical `"/path/"` form
pub fn normalize_root(root: &str) -> String {
    let root = if root.is_empty() { "/" } else { root };
    let parts: Vec<&str> = root.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", parts.join("/"))
    }
}

/// Packages installed under one root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub installed: Vec<String>,
}

/// Serialized form of a [`StaticPackageDatabase`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub roots: BTreeMap<String, RootConfig>,
    #[serde(default)]
    pub repositories: Vec<RepositoryInfo>,
}

/// In-memory package database
#[derive(Debug, Clone)]
pub struct StaticPackageDatabase {
    roots: BTreeMap<String, Vec<String>>,
    repositories: BTreeMap<String, RepositoryInfo>,
}

impl Default for StaticPackageDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticPackageDatabase {
    /// Empty database knowing only the `/` root
    pub fn new() -> Self {
        let mut roots = BTreeMap::new();
        roots.insert("/".to_string(), Vec::new());
        Self {
            roots,
            repositories: BTreeMap::new(),
        }
    }

    pub fn from_yaml(yaml: &str) -> QueryResult<Self> {
        Ok(Self::from_config(serde_yaml::from_str(yaml)?))
    }

    /// Build from a parsed description
    pub fn from_config(config: DatabaseConfig) -> Self {
        let mut db = Self::new();
        for (root, entry) in config.roots {
            db.roots.insert(normalize_root(&root), entry.installed);
        }
        for repo in config.repositories {
            db.repositories.insert(repo.name.clone(), repo);
        }
        db
    }

    pub fn with_installed(mut self, root: &str, packages: &[&str]) -> Self {
        self.roots
            .entry(normalize_root(root))
            .or_default()
            .extend(packages.iter().map(|p| p.to_string()));
        self
    }

    pub fn with_repository(mut self, repo: RepositoryInfo) -> Self {
        self.repositories.insert(repo.name.clone(), repo);
        self
    }
}

impl PackageDatabase for StaticPackageDatabase {
    fn has_root(&self, root: &str) -> bool {
        self.roots.contains_key(root)
    }

    fn installed(&self, root: &str) -> Vec<String> {
        self.roots.get(root).cloned().unwrap_or_default()
    }

    fn repository(&self, name: &str) -> Option<RepositoryInfo> {
        self.repositories.get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Less,
    LessOrEqual,
    Equal,
    Approximate,
    GreaterOrEqual,
    Greater,
}

/// A package atom such as `>=dev-lang/perl-5.36:0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    op: Option<Operator>,
    pub category: String,
    pub name: String,
    pub version: Option<String>,
    glob: bool,
}

fn valid_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'))
        && !s.starts_with('-')
}

fn valid_repo_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '-'))
}

/// Split `name-version` at the first `-` that starts a version
fn split_version(pv: &str) -> Option<(&str, &str)> {
    pv.char_indices()
        .filter(|(_, c)| *c == '-')
        .find(|(i, _)| {
            pv[i + 1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        })
        .map(|(i, _)| (&pv[..i], &pv[i + 1..]))
}

impl Atom {
    pub fn parse(atom: &str) -> QueryResult<Self> {
        let invalid = || QueryError::InvalidAtom(atom.to_string());

        let (op, rest) = [
            (">=", Operator::GreaterOrEqual),
            ("<=", Operator::LessOrEqual),
            ("=", Operator::Equal),
            ("~", Operator::Approximate),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ]
        .iter()
        .find_map(|(prefix, op)| atom.strip_prefix(prefix).map(|rest| (Some(*op), rest)))
        .unwrap_or((None, atom));

        // Slot and repository restrictions are accepted and not evaluated.
        let rest = rest.split("::").next().unwrap_or(rest);
        let rest = rest.split(':').next().unwrap_or(rest);

        let (category, pv) = rest.split_once('/').ok_or_else(invalid)?;
        if !valid_name(category) {
            return Err(invalid());
        }

        let (pv, glob) = match pv.strip_suffix('*') {
            Some(pv) if op == Some(Operator::Equal) => (pv, true),
            Some(_) => return Err(invalid()),
            None => (pv, false),
        };

        let (name, version) = match op {
            Some(_) => {
                let (name, version) = split_version(pv).ok_or_else(invalid)?;
                (name, Some(version.to_string()))
            }
            None => {
                if split_version(pv).is_some() {
                    return Err(invalid());
                }
                (pv, None)
            }
        };
        if !valid_name(name) {
            return Err(invalid());
        }

        Ok(Self {
            op,
            category: category.to_string(),
            name: name.to_string(),
            version,
            glob,
        })
    }

    /// Whether the installed `category/name-version` satisfies this atom
    pub fn matches(&self, cpv: &str) -> bool {
        let Some((category, pv)) = cpv.split_once('/') else {
            return false;
        };
        let Some((name, version)) = split_version(pv) else {
            return false;
        };
        if category != self.category || name != self.name {
            return false;
        }
        let (Some(op), Some(wanted)) = (self.op, self.version.as_deref()) else {
            return true;
        };

        match op {
            Operator::Equal if self.glob => version.starts_with(wanted),
            Operator::Equal => compare_versions(version, wanted) == Ordering::Equal,
            Operator::Approximate => {
                compare_versions(strip_revision(version), strip_revision(wanted)) == Ordering::Equal
            }
            Operator::Less => compare_versions(version, wanted) == Ordering::Less,
            Operator::LessOrEqual => compare_versions(version, wanted) != Ordering::Greater,
            Operator::Greater => compare_versions(version, wanted) == Ordering::Greater,
            Operator::GreaterOrEqual => compare_versions(version, wanted) != Ordering::Less,
        }
    }
}

fn strip_revision(version: &str) -> &str {
    match version.rsplit_once("-r") {
        Some((base, rev)) if !rev.is_empty() && rev.chars().all(|c| c.is_ascii_digit()) => base,
        _ => version,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Component<'a> {
    Number(u64),
    Text(&'a str),
}

fn components(version: &str) -> Vec<Component<'_>> {
    let mut out = Vec::new();
    for part in version.split(['.', '_', '-']) {
        let mut start = 0;
        let bytes = part.as_bytes();
        while start < bytes.len() {
            let digit = bytes[start].is_ascii_digit();
            let end = bytes[start..]
                .iter()
                .position(|b| b.is_ascii_digit() != digit)
                .map_or(bytes.len(), |n| start + n);
            let token = &part[start..end];
            out.push(if digit {
                Component::Number(token.parse().unwrap_or(u64::MAX))
            } else {
                Component::Text(token)
            });
            start = end;
        }
    }
    out
}

/// Version ordering.
///
/// The release part compares component-wise, numbers numerically and text
/// lexically. Then `_alpha < _beta < _pre < _rc < (none) < _p` suffixes,
/// then the `-rN` revision.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, a_revision) = split_revision(a);
    let (b, b_revision) = split_revision(b);
    let (a, a_suffixes) = split_suffixes(a);
    let (b, b_suffixes) = split_suffixes(b);
    compare_components(a, b)
        .then_with(|| compare_suffixes(&a_suffixes, &b_suffixes))
        .then(a_revision.cmp(&b_revision))
}

fn split_revision(version: &str) -> (&str, u64) {
    let base = strip_revision(version);
    let revision = version[base.len()..]
        .strip_prefix("-r")
        .and_then(|rev| rev.parse().ok())
        .unwrap_or(0);
    (base, revision)
}

/// Rank of a suffix relative to a release without one
fn suffix_rank(kind: &str) -> Option<i8> {
    match kind {
        "alpha" => Some(-4),
        "beta" => Some(-3),
        "pre" => Some(-2),
        "rc" => Some(-1),
        "p" => Some(1),
        _ => None,
    }
}

/// Split `1.0_rc2_p1` into `1.0` and its ranked suffixes.
///
/// An unknown suffix leaves the whole string as the release part.
fn split_suffixes(version: &str) -> (&str, Vec<(i8, u64)>) {
    let mut parts = version.split('_');
    let release = parts.next().unwrap_or(version);
    let mut suffixes = Vec::new();
    for part in parts {
        let digits = part.find(|c: char| c.is_ascii_digit()).unwrap_or(part.len());
        let (kind, number) = part.split_at(digits);
        match suffix_rank(kind) {
            Some(rank) if number.chars().all(|c| c.is_ascii_digit()) => {
                suffixes.push((rank, number.parse().unwrap_or(0)));
            }
            _ => return (version, Vec::new()),
        }
    }
    (release, suffixes)
}

fn compare_suffixes(a: &[(i8, u64)], b: &[(i8, u64)]) -> Ordering {
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or((0, 0));
        let y = b.get(i).copied().unwrap_or((0, 0));
        let ord = x.cmp(&y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_components(a: &str, b: &str) -> Ordering {
    let (a, b) = (components(a), components(b));
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x, y) {
            (Component::Number(x), Component::Number(y)) => x.cmp(y),
            (Component::Text(x), Component::Text(y)) => x.cmp(y),
            (Component::Number(_), Component::Text(_)) => Ordering::Greater,
            (Component::Text(_), Component::Number(_)) => Ordering::Less,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Highest version among `cpvs`
pub fn best(cpvs: &[String]) -> Option<&String> {
    cpvs.iter().max_by(|a, b| {
        let va = a.split_once('/').and_then(|(_, pv)| split_version(pv)).map(|(_, v)| v);
        let vb = b.split_once('/').and_then(|(_, pv)| split_version(pv)).map(|(_, v)| v);
        compare_versions(va.unwrap_or(""), vb.unwrap_or(""))
    })
}

/// Answers query commands against a [`PackageDatabase`]
pub struct QueryHandler {
    db: Arc<dyn PackageDatabase>,
}

impl QueryHandler {
    pub fn new(db: Arc<dyn PackageDatabase>) -> Self {
        Self { db }
    }

    pub fn handle(&self, command: &IpcCommand) -> IpcReply {
        let name = command.name();
        let root = match command {
            IpcCommand::BestVersion { root, .. }
            | IpcCommand::HasVersion { root, .. }
            | IpcCommand::EclassPath { root, .. }
            | IpcCommand::LicensePath { root, .. }
            | IpcCommand::MasterRepositories { root, .. }
            | IpcCommand::RepositoryPath { root, .. }
            | IpcCommand::AvailableEclasses { root, .. } => normalize_root(root),
            IpcCommand::Exit { .. } => {
                return IpcReply::error(format!("Invalid command: {}\n", name), QUERY_INVALID_COMMAND);
            }
        };
        if !self.db.has_root(&root) {
            return IpcReply::error(
                format!("{}: Invalid ROOT: {}\n", name, root),
                QUERY_INVALID_COMMAND,
            );
        }

        match command {
            IpcCommand::BestVersion { atom, .. } | IpcCommand::HasVersion { atom, .. } => {
                let parsed = match Atom::parse(atom) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        return IpcReply::error(
                            format!("{}: Invalid atom: {}\n", name, atom),
                            QUERY_INVALID_ARGUMENT,
                        );
                    }
                };
                let matched: Vec<String> = self
                    .db
                    .installed(&root)
                    .into_iter()
                    .filter(|cpv| parsed.matches(cpv))
                    .collect();
                if matches!(command, IpcCommand::HasVersion { .. }) {
                    if matched.is_empty() {
                        IpcReply::not_found()
                    } else {
                        IpcReply::ok("")
                    }
                } else {
                    IpcReply::ok(format!("{}\n", best(&matched).map_or("", |s| s.as_str())))
                }
            }
            IpcCommand::EclassPath { repository, .. }
            | IpcCommand::LicensePath { repository, .. }
            | IpcCommand::MasterRepositories { repository, .. }
            | IpcCommand::RepositoryPath { repository, .. }
            | IpcCommand::AvailableEclasses { repository, .. } => {
                if !valid_repo_name(repository) {
                    return IpcReply::error(
                        format!("{}: Invalid repository: {}\n", name, repository),
                        QUERY_INVALID_ARGUMENT,
                    );
                }
                let Some(repo) = self.db.repository(repository) else {
                    return IpcReply::not_found();
                };
                self.repository_query(command, &repo)
            }
            IpcCommand::Exit { .. } => {
                IpcReply::error(format!("Invalid command: {}\n", name), QUERY_INVALID_COMMAND)
            }
        }
    }

    fn repository_query(&self, command: &IpcCommand, repo: &RepositoryInfo) -> IpcReply {
        match command {
            IpcCommand::MasterRepositories { .. } => {
                IpcReply::ok(format!("{}\n", repo.masters.join(" ")))
            }
            IpcCommand::RepositoryPath { .. } => {
                IpcReply::ok(format!("{}\n", repo.location.display()))
            }
            IpcCommand::AvailableEclasses { .. } => {
                let names: Vec<&str> = repo.eclasses.keys().map(String::as_str).collect();
                IpcReply::ok(format!("{}\n", names.join(" ")))
            }
            IpcCommand::EclassPath { eclass, .. } => match repo.eclasses.get(eclass) {
                Some(path) => IpcReply::ok(format!("{}\n", path.display())),
                None => IpcReply::not_found(),
            },
            IpcCommand::LicensePath { license, .. } => {
                // The repository itself wins over its masters, later masters
                // over earlier ones.
                let mut locations: Vec<PathBuf> = repo
                    .masters
                    .iter()
                    .filter_map(|master| self.db.repository(master))
                    .map(|master| master.location)
                    .collect();
                locations.push(repo.location.clone());
                locations
                    .iter()
                    .rev()
                    .map(|location| license_file(location, license))
                    .find(|path| path.exists())
                    .map_or_else(IpcReply::not_found, |path| {
                        IpcReply::ok(format!("{}\n", path.display()))
                    })
            }
            _ => IpcReply::error(
                format!("Invalid command: {}\n", command.name()),
                QUERY_INVALID_COMMAND,
            ),
        }
    }
}

fn license_file(location: &Path, license: &str) -> PathBuf {
    location.join("licenses").join(license)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{QUERY_NOT_FOUND, QUERY_OK};
    use tempfile::TempDir;

    fn db() -> StaticPackageDatabase {
        StaticPackageDatabase::new()
            .with_installed(
                "/",
                &["dev-lang/perl-5.36.0", "dev-lang/perl-5.38.2-r1", "sys-libs/zlib-1.3"],
            )
            .with_installed("/mnt/target", &[])
    }

    fn handler(db: StaticPackageDatabase) -> QueryHandler {
        QueryHandler::new(Arc::new(db))
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(""), "/");
        assert_eq!(normalize_root("/"), "/");
        assert_eq!(normalize_root("/mnt/target"), "/mnt/target/");
        assert_eq!(normalize_root("//mnt//target/"), "/mnt/target/");
    }

    #[test]
    fn test_atom_parsing() {
        let atom = Atom::parse(">=dev-lang/perl-5.36:0/5.36::gentoo").unwrap();
        assert_eq!(atom.category, "dev-lang");
        assert_eq!(atom.name, "perl");
        assert_eq!(atom.version.as_deref(), Some("5.36"));

        assert!(Atom::parse("perl").is_err());
        assert!(Atom::parse(">=dev-lang/perl").is_err());
        assert!(Atom::parse("dev-lang/perl-5.36").is_err());
        assert!(Atom::parse("dev-lang/perl*").is_err());
    }

    #[test]
    fn test_version_ordering() {
        assert_eq!(compare_versions("5.38.2", "5.36.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0b", "1.0a"), Ordering::Greater);
        assert_eq!(compare_versions("2.0-r1", "2.0"), Ordering::Greater);
        assert_eq!(compare_versions("3", "3"), Ordering::Equal);
    }

    #[test]
    fn test_suffix_ordering() {
        assert_eq!(compare_versions("1.0_rc1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0_alpha", "1.0_beta2"), Ordering::Less);
        assert_eq!(compare_versions("1.0_pre3", "1.0_rc1"), Ordering::Less);
        assert_eq!(compare_versions("1.0_p1", "1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0_rc2", "1.0_rc10"), Ordering::Less);
        assert_eq!(compare_versions("1.0_rc1-r3", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.1_alpha", "1.0_p5"), Ordering::Greater);
        assert_eq!(
            best(&[
                "dev-lang/perl-5.38_rc1".to_string(),
                "dev-lang/perl-5.38".to_string(),
            ]),
            Some(&"dev-lang/perl-5.38".to_string())
        );
    }

    #[test]
    fn test_atom_matching() {
        let installed = "dev-lang/perl-5.38.2-r1";
        assert!(Atom::parse("dev-lang/perl").unwrap().matches(installed));
        assert!(Atom::parse(">=dev-lang/perl-5.38").unwrap().matches(installed));
        assert!(!Atom::parse("<dev-lang/perl-5.38").unwrap().matches(installed));
        assert!(Atom::parse("~dev-lang/perl-5.38.2").unwrap().matches(installed));
        assert!(Atom::parse("=dev-lang/perl-5.38*").unwrap().matches(installed));
        assert!(!Atom::parse("=dev-lang/perl-5.38.2").unwrap().matches(installed));
        assert!(!Atom::parse("dev-lang/python").unwrap().matches(installed));
    }

    #[test]
    fn test_best_and_has_version() {
        let handler = handler(db());
        let reply = handler.handle(&IpcCommand::BestVersion {
            root: "/".into(),
            atom: "dev-lang/perl".into(),
        });
        assert_eq!(reply, IpcReply::ok("dev-lang/perl-5.38.2-r1\n"));

        let reply = handler.handle(&IpcCommand::BestVersion {
            root: "/".into(),
            atom: "dev-lang/python".into(),
        });
        assert_eq!(reply, IpcReply::ok("\n"));

        let reply = handler.handle(&IpcCommand::HasVersion {
            root: "/".into(),
            atom: "<sys-libs/zlib-1.3".into(),
        });
        assert_eq!(reply.returncode, QUERY_NOT_FOUND);

        let reply = handler.handle(&IpcCommand::HasVersion {
            root: "/mnt/target".into(),
            atom: "sys-libs/zlib".into(),
        });
        assert_eq!(reply.returncode, QUERY_NOT_FOUND);
    }

    #[test]
    fn test_invalid_root_and_atom() {
        let handler = handler(db());
        let reply = handler.handle(&IpcCommand::HasVersion {
            root: "/nowhere".into(),
            atom: "sys-libs/zlib".into(),
        });
        assert_eq!(reply.returncode, QUERY_INVALID_COMMAND);
        assert_eq!(reply.stderr, "has_version: Invalid ROOT: /nowhere/\n");

        let reply = handler.handle(&IpcCommand::HasVersion {
            root: "/".into(),
            atom: "not an atom".into(),
        });
        assert_eq!(reply.returncode, QUERY_INVALID_ARGUMENT);
        assert!(reply.stderr.contains("Invalid atom"));
    }

    #[test]
    fn test_repository_queries() {
        let dir = TempDir::new().unwrap();
        let master = dir.path().join("gentoo");
        let overlay = dir.path().join("overlay");
        std::fs::create_dir_all(master.join("licenses")).unwrap();
        std::fs::create_dir_all(overlay.join("licenses")).unwrap();
        std::fs::write(master.join("licenses/GPL-2"), "").unwrap();
        std::fs::write(master.join("licenses/MIT"), "").unwrap();
        std::fs::write(overlay.join("licenses/MIT"), "").unwrap();

        let mut eclasses = BTreeMap::new();
        eclasses.insert("meson".to_string(), overlay.join("eclass/meson.eclass"));
        eclasses.insert("cmake".to_string(), overlay.join("eclass/cmake.eclass"));

        let handler = handler(
            db().with_repository(RepositoryInfo {
                name: "gentoo".into(),
                location: master.clone(),
                masters: vec![],
                eclasses: BTreeMap::new(),
            })
            .with_repository(RepositoryInfo {
                name: "overlay".into(),
                location: overlay.clone(),
                masters: vec!["gentoo".into()],
                eclasses,
            }),
        );

        let query = |command: IpcCommand| handler.handle(&command);
        let repo = || "overlay".to_string();

        assert_eq!(
            query(IpcCommand::MasterRepositories { root: "/".into(), repository: repo() }),
            IpcReply::ok("gentoo\n")
        );
        assert_eq!(
            query(IpcCommand::RepositoryPath { root: "/".into(), repository: repo() }),
            IpcReply::ok(format!("{}\n", overlay.display()))
        );
        assert_eq!(
            query(IpcCommand::AvailableEclasses { root: "/".into(), repository: repo() }),
            IpcReply::ok("cmake meson\n")
        );
        assert_eq!(
            query(IpcCommand::EclassPath {
                root: "/".into(),
                repository: repo(),
                eclass: "autotools".into()
            })
            .returncode,
            QUERY_NOT_FOUND
        );
        assert_eq!(
            query(IpcCommand::LicensePath {
                root: "/".into(),
                repository: repo(),
                license: "MIT".into()
            }),
            IpcReply::ok(format!("{}\n", overlay.join("licenses/MIT").display()))
        );
        assert_eq!(
            query(IpcCommand::LicensePath {
                root: "/".into(),
                repository: repo(),
                license: "GPL-2".into()
            }),
            IpcReply::ok(format!("{}\n", master.join("licenses/GPL-2").display()))
        );

        let unknown = query(IpcCommand::RepositoryPath {
            root: "/".into(),
            repository: "missing".into(),
        });
        assert_eq!(unknown.returncode, QUERY_NOT_FOUND);

        let invalid = query(IpcCommand::RepositoryPath {
            root: "/".into(),
            repository: "-bad".into(),
        });
        assert_eq!(invalid.returncode, QUERY_INVALID_ARGUMENT);
        assert_ne!(invalid.returncode, QUERY_OK);
    }
}
