//! Capability traits every remote backend implements.
//!
//! All paths are relative to the remote root in the `/`-separated form of
//! [`cfsync_core::paths`]. The empty string is the root itself.
//!
//! Errors are `anyhow::Result` at this boundary: backend failures are
//! adapter-specific and callers only need to log them or fall back.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cfsync_core::{
    CfsyncError, LocalEntryInfo, RemoteDirectoryInfo, RemoteEntry, RemoteFileInfo,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Read access: enumerate, stat, and ranged content reads.
#[async_trait]
pub trait RemoteRead: Send + Sync {
    /// Direct children of `dir` whose names match the glob `pattern`
    /// (`""` or `"*"` for everything).
    async fn try_enumerate(&self, dir: &str, pattern: &str) -> Result<Vec<RemoteEntry>>;

    /// Stat one entry. `Ok(None)` when it does not exist.
    async fn stat(&self, relative: &str) -> Result<Option<RemoteEntry>>;

    /// Read `len` bytes at `offset`. Short reads happen only at end of file.
    async fn read_range(&self, relative: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Like [`try_enumerate`](Self::try_enumerate), but an unreachable or
    /// disconnected remote degrades to an empty listing.
    async fn enumerate(&self, dir: &str, pattern: &str) -> Vec<RemoteEntry> {
        match self.try_enumerate(dir, pattern).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir, "remote enumerate failed, treating as empty: {e:#}");
                Vec::new()
            }
        }
    }

    async fn exists(&self, relative: &str) -> Result<bool> {
        Ok(self.stat(relative).await?.is_some())
    }

    async fn is_directory(&self, relative: &str) -> Result<bool> {
        Ok(matches!(
            self.stat(relative).await?,
            Some(RemoteEntry::Directory(_))
        ))
    }

    async fn get_file_info(&self, relative: &str) -> Result<RemoteFileInfo> {
        match self.stat(relative).await? {
            Some(RemoteEntry::File(info)) => Ok(info),
            Some(RemoteEntry::Directory(_)) => {
                anyhow::bail!("remote path is a directory: {relative}")
            }
            None => Err(CfsyncError::NotFound(relative.to_string()).into()),
        }
    }

    async fn get_directory_info(&self, relative: &str) -> Result<RemoteDirectoryInfo> {
        match self.stat(relative).await? {
            Some(RemoteEntry::Directory(info)) => Ok(info),
            Some(RemoteEntry::File(_)) => anyhow::bail!("remote path is a file: {relative}"),
            None => Err(CfsyncError::NotFound(relative.to_string()).into()),
        }
    }
}

/// Write access. Uploads read content from `LocalEntryInfo::path`.
#[async_trait]
pub trait RemoteReadWrite: Send + Sync {
    async fn create_file(&self, local: &LocalEntryInfo) -> Result<()>;

    async fn create_directory(&self, local: &LocalEntryInfo) -> Result<()>;

    async fn update_file(&self, local: &LocalEntryInfo) -> Result<()>;

    /// Directories carry no content, so there is nothing to push.
    async fn update_directory(&self, _local: &LocalEntryInfo) -> Result<()> {
        Ok(())
    }

    async fn move_file(&self, old: &str, new: &str) -> Result<()>;

    async fn move_directory(&self, old: &str, new: &str) -> Result<()>;

    async fn delete_file(&self, relative: &str) -> Result<()>;

    /// Removes the directory and everything beneath it.
    async fn delete_directory(&self, relative: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Created { relative: String, is_directory: bool },
    Changed { relative: String, is_directory: bool },
    Renamed { old: String, new: String, is_directory: bool },
    Deleted { relative: String, is_directory: bool },
}

impl RemoteEvent {
    pub fn primary_path(&self) -> &str {
        match self {
            RemoteEvent::Created { relative, .. }
            | RemoteEvent::Changed { relative, .. }
            | RemoteEvent::Deleted { relative, .. } => relative,
            RemoteEvent::Renamed { new, .. } => new,
        }
    }
}

/// Which remote directories the watcher should descend into. Only the
/// portion of the tree already materialized locally is worth watching.
pub type WatchScope = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[async_trait]
pub trait RemoteWatch: Send + Sync {
    /// Start emitting events until `cancel` fires. The channel closes when
    /// the watch loop exits.
    async fn start(
        &self,
        scope: WatchScope,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RemoteEvent>>;
}

/// Glob match of a single entry name; an empty pattern or `*` matches all.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(name),
        Err(_) => pattern == name,
    }
}
