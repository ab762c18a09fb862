//! Local → remote propagation shared by the client watcher and the shell
//! command queue. Callers hold the path lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cfsync_cloudfilter::{CloudFilter, HandleMode, PlaceholderInfo};
use cfsync_core::paths;
use cfsync_remote::{RemoteRead, RemoteReadWrite};
use tracing::{debug, info, warn};

use crate::metrics::SyncMetrics;
use crate::placeholders::PlaceholdersService;

pub struct RemoteUploader {
    filter: Arc<dyn CloudFilter>,
    read: Arc<dyn RemoteRead>,
    write: Arc<dyn RemoteReadWrite>,
    placeholders: Arc<PlaceholdersService>,
    metrics: SyncMetrics,
}

impl RemoteUploader {
    pub fn new(
        filter: Arc<dyn CloudFilter>,
        read: Arc<dyn RemoteRead>,
        write: Arc<dyn RemoteReadWrite>,
        placeholders: Arc<PlaceholdersService>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            filter,
            read,
            write,
            placeholders,
            metrics,
        }
    }

    fn info(&self, relative: &str) -> Result<Option<PlaceholderInfo>> {
        self.placeholders.local_info(relative)
    }

    /// Create `relative` on the remote from local content, descending into a
    /// new directory tree. Children that fail are logged and skipped.
    pub async fn create_remote(&self, relative: &str) -> Result<()> {
        let mut pending = match self.create_one(relative).await? {
            Some(dir) => vec![(relative.to_string(), dir)],
            None => return Ok(()),
        };
        while let Some((parent, dir)) = pending.pop() {
            for child in list_children(&dir).await? {
                let rel = paths::join(&parent, &child);
                if self.placeholders.is_excluded(&rel) {
                    continue;
                }
                match self.create_one(&rel).await {
                    Ok(Some(sub)) => pending.push((rel, sub)),
                    Ok(None) => {}
                    Err(e) => warn!(path = %rel, "upload of child failed: {e:#}"),
                }
            }
        }
        Ok(())
    }

    /// Upload one entry. Returns the local directory to descend into.
    async fn create_one(&self, relative: &str) -> Result<Option<PathBuf>> {
        let Some(info) = self.info(relative)? else {
            debug!(path = %relative, "nothing to upload, entry vanished");
            return Ok(None);
        };
        let local = info.to_local_entry(relative);
        if !info.is_directory {
            self.write
                .create_file(&local)
                .await
                .with_context(|| format!("uploading {relative}"))?;
            self.metrics.uploads.inc();
            self.placeholders.mark_uploaded(relative).await?;
            info!(path = %relative, length = info.length, "file uploaded");
            return Ok(None);
        }

        self.write
            .create_directory(&local)
            .await
            .with_context(|| format!("creating remote directory {relative}"))?;
        self.metrics.uploads.inc();
        let handle = self
            .placeholders
            .open_with_retry(&info.path, HandleMode::Plain)
            .await?;
        if info.is_placeholder {
            self.filter.set_in_sync(&handle, true).await?;
        } else {
            self.filter.convert_to_placeholder(&handle, true).await?;
        }
        info!(path = %relative, "directory uploaded");
        Ok(Some(info.path))
    }

    /// Push a local change. A file is uploaded only when it is fully
    /// present, out of sync and newer than the remote copy.
    pub async fn push_update(&self, relative: &str) -> Result<()> {
        let Some(info) = self.info(relative)? else {
            return Ok(());
        };
        let Some(remote) = self.read.stat(relative).await? else {
            if info.is_placeholder && info.in_sync {
                // Deleted remotely; the remote watcher removes it
                return Ok(());
            }
            return self.create_remote(relative).await;
        };

        let local = info.to_local_entry(relative);
        if info.is_directory {
            self.write.update_directory(&local).await?;
            return Ok(());
        }
        if !info.is_fully_present() || (info.is_placeholder && info.in_sync) {
            return Ok(());
        }
        if info.modified <= remote.info().modified {
            debug!(path = %relative, "remote copy is as new as the local edit, not uploading");
            return Ok(());
        }
        self.write
            .update_file(&local)
            .await
            .with_context(|| format!("uploading {relative}"))?;
        self.metrics.uploads.inc();
        self.placeholders.mark_uploaded(relative).await?;
        info!(path = %relative, length = info.length, "local change uploaded");
        Ok(())
    }
}

async fn list_children(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
