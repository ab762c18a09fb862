use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use crate::attributes::FileAttributes;
use crate::config::SyncRootConfig;
use crate::fingerprint::Fingerprint;
use crate::paths;
use crate::registration::SyncRootId;

/// How placeholders are populated when a sync root connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopulationPolicy {
    /// Populate the whole remote namespace on connect.
    #[default]
    Full,
    /// Populate directories when the OS first enumerates them.
    Lazy,
}

/// Which remote backend serves a sync root. Resolved once at worker start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    #[default]
    Sftp,
    S3,
    Memory,
}

impl RemoteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteKind::Sftp => "sftp",
            RemoteKind::S3 => "s3",
            RemoteKind::Memory => "memory",
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            RemoteKind::Sftp => 1,
            RemoteKind::S3 => 2,
            RemoteKind::Memory => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RemoteKind::Sftp),
            2 => Some(RemoteKind::S3),
            3 => Some(RemoteKind::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteKind {
    type Err = crate::CfsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sftp" => Ok(RemoteKind::Sftp),
            "s3" => Ok(RemoteKind::S3),
            "memory" => Ok(RemoteKind::Memory),
            other => Err(crate::CfsyncError::Config(format!(
                "unknown remote kind: {other:?}"
            ))),
        }
    }
}

/// Identity of one connected sync root. Immutable for the life of a worker
/// and passed explicitly to every component that needs it.
#[derive(Debug, Clone)]
pub struct SyncProviderContext {
    pub id: SyncRootId,
    pub display_name: String,
    pub root: PathBuf,
    pub population_policy: PopulationPolicy,
    pub remote_kind: RemoteKind,
}

impl SyncProviderContext {
    pub fn from_config(cfg: &SyncRootConfig) -> Self {
        Self {
            id: SyncRootId::new(&cfg.account),
            display_name: cfg.display_name.clone(),
            root: cfg.local_path.clone(),
            population_policy: cfg.population_policy,
            remote_kind: cfg.remote.kind,
        }
    }

    /// Relative form of a local path, `None` if it lies outside this root.
    pub fn relative_path(&self, local: &Path) -> Option<String> {
        paths::relative_to(&self.root, local)
    }

    pub fn local_path(&self, relative: &str) -> PathBuf {
        paths::to_local(&self.root, relative)
    }
}

/// Metadata snapshot shared by remote files and directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileSystemInfo {
    pub name: String,
    pub attributes: FileAttributes,
    /// Path relative to the remote root.
    pub relative_path: String,
    pub relative_parent: String,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl RemoteFileSystemInfo {
    /// Build a snapshot for `relative_path`, deriving name and parent.
    pub fn new(relative_path: &str, attributes: FileAttributes, modified: SystemTime) -> Self {
        let relative_path = paths::normalize_relative(relative_path);
        Self {
            name: paths::file_name(&relative_path).to_string(),
            relative_parent: paths::parent_of(&relative_path).to_string(),
            relative_path,
            attributes,
            created: modified,
            modified,
            accessed: modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub info: RemoteFileSystemInfo,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirectoryInfo {
    pub info: RemoteFileSystemInfo,
}

impl RemoteFileInfo {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_file(self.length, self.info.modified, self.info.attributes)
    }
}

impl RemoteDirectoryInfo {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_directory(self.info.modified, self.info.attributes)
    }
}

/// One entry produced by a remote stat or enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    File(RemoteFileInfo),
    Directory(RemoteDirectoryInfo),
}

impl RemoteEntry {
    pub fn info(&self) -> &RemoteFileSystemInfo {
        match self {
            RemoteEntry::File(f) => &f.info,
            RemoteEntry::Directory(d) => &d.info,
        }
    }

    pub fn relative_path(&self) -> &str {
        &self.info().relative_path
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, RemoteEntry::Directory(_))
    }

    pub fn length(&self) -> u64 {
        match self {
            RemoteEntry::File(f) => f.length,
            RemoteEntry::Directory(_) => 0,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            RemoteEntry::File(f) => f.fingerprint(),
            RemoteEntry::Directory(d) => d.fingerprint(),
        }
    }
}

/// Snapshot of a local entry, handed to the remote read-write capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntryInfo {
    /// Absolute local path (content is read from here on upload).
    pub path: PathBuf,
    pub relative_path: String,
    pub is_directory: bool,
    pub length: u64,
    pub attributes: FileAttributes,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl LocalEntryInfo {
    pub fn fingerprint(&self) -> Fingerprint {
        if self.is_directory {
            Fingerprint::of_directory(self.modified, self.attributes)
        } else {
            Fingerprint::of_file(self.length, self.modified, self.attributes)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellCommandKind {
    /// Make this path consistent with the remote (upload or project).
    Sync,
}

/// A user-issued context-menu action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub kind: ShellCommandKind,
    pub path: PathBuf,
}

impl ShellCommand {
    pub fn sync(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ShellCommandKind::Sync,
            path: path.into(),
        }
    }
}
