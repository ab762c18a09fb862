//! Placeholder lifecycle: create, update, rename, delete, hydrate, dehydrate.
//!
//! Callers hold the path lock for whatever they pass in; nothing here takes
//! one. Remote metadata is authoritative: a placeholder is brought to match
//! it, and an update is skipped when the equality fingerprint already agrees.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cfsync_cloudfilter::{
    CloudFilter, HandleMode, PlaceholderDescriptor, PlaceholderHandle, PlaceholderInfo,
    PlaceholderMetadata, UpdateFlags,
};
use cfsync_core::paths::{self, ExcludeFilter};
use cfsync_core::{CfsyncError, PinState, RemoteEntry, SyncProviderContext, SyncSettings};
use cfsync_remote::RemoteRead;
use tracing::{debug, info, warn};

use crate::metrics::SyncMetrics;

/// What [`PlaceholdersService::update_file`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Already matched the remote, or the local copy is newer.
    Skipped,
    /// Nothing to update on one side or the other.
    Missing,
}

pub struct PlaceholdersService {
    context: Arc<SyncProviderContext>,
    filter: Arc<dyn CloudFilter>,
    remote: Arc<dyn RemoteRead>,
    settings: SyncSettings,
    excludes: ExcludeFilter,
    metrics: SyncMetrics,
}

impl PlaceholdersService {
    pub fn new(
        context: Arc<SyncProviderContext>,
        filter: Arc<dyn CloudFilter>,
        remote: Arc<dyn RemoteRead>,
        settings: SyncSettings,
        metrics: SyncMetrics,
    ) -> Self {
        let excludes = ExcludeFilter::new(&settings.exclude_patterns);
        Self {
            context,
            filter,
            remote,
            settings,
            excludes,
            metrics,
        }
    }

    pub fn context(&self) -> &SyncProviderContext {
        &self.context
    }

    pub fn local_path(&self, relative: &str) -> PathBuf {
        self.context.local_path(relative)
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        self.excludes.is_excluded(relative)
    }

    pub fn local_info(&self, relative: &str) -> Result<Option<PlaceholderInfo>> {
        Ok(self.filter.info(&self.local_path(relative))?)
    }

    /// A directory that exists locally with its children supplied. The
    /// remote watcher only descends into these.
    pub fn is_materialized(&self, relative: &str) -> bool {
        matches!(
            self.filter.info(&self.local_path(relative)),
            Ok(Some(info)) if info.is_directory && info.populated
        )
    }

    /// Open `path`, waiting out other processes that hold it.
    pub async fn open_with_retry(&self, path: &Path, mode: HandleMode) -> Result<PlaceholderHandle> {
        let attempts = self.settings.lock_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.filter.open(path, mode) {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_transient() => {
                    debug!(path = %path.display(), attempt, "file in use, retrying");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.lock_retry_delay()).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(path = %path.display(), attempts, "file stayed in use, giving up");
        Err(CfsyncError::FileLocked {
            path: path.to_path_buf(),
            attempts,
        }
        .into())
    }

    fn descriptor(&self, entry: &RemoteEntry) -> PlaceholderDescriptor {
        let mut descriptor = PlaceholderDescriptor::from_remote(entry);
        // Bulk population supplies directory children itself
        descriptor.disable_on_demand_population = entry.is_directory();
        descriptor
    }

    /// Populate every remote file and directory under `subpath`, one entry
    /// at a time. Entries that already exist locally are brought up to date.
    /// Per-entry failures are logged and skipped. Returns the number of
    /// placeholders created.
    pub async fn create_bulk(&self, subpath: &str) -> Result<usize> {
        let subpath = paths::normalize_relative(subpath);
        let base = self.local_path(&subpath);
        match self.filter.info(&base)? {
            None => bail!("cannot populate missing directory {}", base.display()),
            Some(info) if !info.is_directory => bail!("not a directory: {}", base.display()),
            Some(info) if !info.is_placeholder => {
                let handle = self.open_with_retry(&base, HandleMode::Plain).await?;
                self.filter.convert_to_placeholder(&handle, true).await?;
            }
            Some(_) => {}
        }

        let mut created = 0usize;
        let mut pending = vec![subpath.clone()];
        while let Some(dir) = pending.pop() {
            let parent = self.local_path(&dir);
            for entry in self.remote.enumerate(&dir, "*").await {
                let rel = entry.relative_path().to_string();
                if self.excludes.is_excluded(&rel) {
                    continue;
                }
                let local = self.local_path(&rel);
                let outcome = if local.symlink_metadata().is_ok() {
                    if entry.is_directory() {
                        self.update_directory(&rel).await.map(|_| false)
                    } else {
                        self.update_file(&rel, false).await.map(|_| false)
                    }
                } else {
                    self.filter
                        .create_placeholders(&parent, &[self.descriptor(&entry)])
                        .await
                        .map(|_| true)
                        .map_err(anyhow::Error::from)
                };
                match outcome {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(path = %rel, "bulk populate entry failed: {e:#}");
                        continue;
                    }
                }
                if entry.is_directory() {
                    pending.push(rel);
                }
            }
            let handle = self.open_with_retry(&parent, HandleMode::Plain).await?;
            self.filter
                .update_placeholder(
                    &handle,
                    None,
                    UpdateFlags {
                        mark_in_sync: true,
                        disable_on_demand_population: true,
                        ..Default::default()
                    },
                )
                .await?;
        }
        info!(root = %self.context.id, subpath = %subpath, created, "bulk populate complete");
        Ok(created)
    }

    async fn create_single(&self, relative: &str, entry: &RemoteEntry) -> Result<()> {
        let parent = self.local_path(paths::parent_of(relative));
        self.filter
            .create_placeholders(&parent, &[PlaceholderDescriptor::from_remote(entry)])
            .await
            .with_context(|| format!("creating placeholder {relative}"))?;
        debug!(path = %relative, "placeholder created");
        Ok(())
    }

    pub async fn create_file(&self, relative: &str) -> Result<()> {
        let info = self.remote.get_file_info(relative).await?;
        self.create_single(relative, &RemoteEntry::File(info)).await
    }

    pub async fn create_directory(&self, relative: &str) -> Result<()> {
        let info = self.remote.get_directory_info(relative).await?;
        self.create_single(relative, &RemoteEntry::Directory(info))
            .await
    }

    pub async fn create_or_update_file(&self, relative: &str) -> Result<()> {
        if self.local_path(relative).symlink_metadata().is_ok() {
            self.update_file(relative, false).await.map(|_| ())
        } else {
            self.create_file(relative).await
        }
    }

    pub async fn create_or_update_directory(&self, relative: &str) -> Result<()> {
        if self.local_path(relative).symlink_metadata().is_ok() {
            self.update_directory(relative).await
        } else {
            self.create_directory(relative).await
        }
    }

    /// Bring a local file in line with the remote. See [`UpdateOutcome`].
    ///
    /// A pinned file has its pin cleared for the update and restored after;
    /// hydrated content is evicted with the stale metadata and recalled
    /// afterwards unless the file is unpinned.
    pub async fn update_file(&self, relative: &str, force: bool) -> Result<UpdateOutcome> {
        let path = self.local_path(relative);
        let Some(mut local) = self.filter.info(&path)? else {
            debug!(path = %relative, "update skipped, no local entry");
            return Ok(UpdateOutcome::Missing);
        };
        if local.is_directory {
            bail!("update_file on a directory: {relative}");
        }
        let mode = if local.is_fully_present() {
            HandleMode::HeldOpen
        } else {
            HandleMode::Plain
        };
        let handle = self.open_with_retry(&path, mode).await?;
        if !local.is_placeholder {
            self.filter.convert_to_placeholder(&handle, false).await?;
            local = self
                .filter
                .info(&path)?
                .with_context(|| format!("{relative} vanished during conversion"))?;
        }

        let remote = match self.remote.stat(relative).await? {
            Some(entry @ RemoteEntry::File(_)) => entry,
            Some(RemoteEntry::Directory(_)) => bail!("remote {relative} is a directory"),
            None => {
                debug!(path = %relative, "update skipped, not on remote");
                return Ok(UpdateOutcome::Missing);
            }
        };

        if !force && local.fingerprint() == remote.fingerprint() {
            if !local.in_sync {
                self.filter.set_in_sync(&handle, true).await?;
            }
            debug!(path = %relative, "placeholder already matches remote");
            self.metrics.update_skipped();
            return Ok(UpdateOutcome::Skipped);
        }
        if !force
            && local.is_fully_present()
            && !local.in_sync
            && local.modified > remote.info().modified
        {
            debug!(path = %relative, "local edit is newer than remote, keeping it");
            self.metrics.update_skipped();
            return Ok(UpdateOutcome::Skipped);
        }

        let pin = local.pin_state();
        let hydrated = local.is_fully_present();
        if pin == PinState::Pinned {
            self.filter
                .set_pin_state(&handle, PinState::Unspecified)
                .await?;
        }
        let metadata = PlaceholderMetadata::from_remote(&remote);
        let applied = self
            .filter
            .update_placeholder(
                &handle,
                Some(&metadata),
                UpdateFlags {
                    dehydrate: hydrated,
                    mark_in_sync: true,
                    ..Default::default()
                },
            )
            .await;
        if pin == PinState::Pinned {
            self.filter.set_pin_state(&handle, pin).await?;
        }
        applied.with_context(|| format!("updating placeholder {relative}"))?;
        drop(handle);

        if (hydrated && pin != PinState::Unpinned) || pin == PinState::Pinned {
            self.filter
                .hydrate(&path)
                .await
                .with_context(|| format!("re-hydrating {relative}"))?;
        }
        self.metrics.update_applied();
        info!(path = %relative, length = metadata.length, "placeholder updated from remote");
        Ok(UpdateOutcome::Applied)
    }

    /// Directories carry no content: make sure it is a placeholder and in sync.
    pub async fn update_directory(&self, relative: &str) -> Result<()> {
        let path = self.local_path(relative);
        let info = self
            .filter
            .info(&path)?
            .with_context(|| format!("no local directory {relative}"))?;
        let handle = self.open_with_retry(&path, HandleMode::Plain).await?;
        if !info.is_placeholder {
            self.filter.convert_to_placeholder(&handle, true).await?;
        } else if !info.in_sync {
            self.filter.set_in_sync(&handle, true).await?;
        }
        Ok(())
    }

    /// Apply the remote's view of a just-uploaded file without touching its
    /// content, so a server-assigned write time does not read as a change.
    pub async fn mark_uploaded(&self, relative: &str) -> Result<()> {
        let path = self.local_path(relative);
        let handle = self.open_with_retry(&path, HandleMode::HeldOpen).await?;
        let info = self
            .filter
            .info(&path)?
            .with_context(|| format!("{relative} vanished after upload"))?;
        if !info.is_placeholder {
            self.filter.convert_to_placeholder(&handle, true).await?;
        }
        match self.remote.stat(relative).await? {
            Some(entry) if entry.is_directory() => self.filter.set_in_sync(&handle, true).await?,
            Some(entry) if entry.length() == info.length => {
                // Adopt the uploaded bytes first so the remote length is not a size change
                self.filter.set_in_sync(&handle, true).await?;
                let metadata = PlaceholderMetadata::from_remote(&entry);
                self.filter
                    .update_placeholder(
                        &handle,
                        Some(&metadata),
                        UpdateFlags {
                            mark_in_sync: true,
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            // Written again while uploading; the next change event picks it up
            Some(_) => debug!(path = %relative, "local file changed during upload"),
            None => bail!("{relative} missing on remote right after upload"),
        }
        Ok(())
    }

    pub async fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        self.rename(old, new, false).await
    }

    pub async fn rename_directory(&self, old: &str, new: &str) -> Result<()> {
        self.rename(old, new, true).await
    }

    async fn rename(&self, old: &str, new: &str, is_directory: bool) -> Result<()> {
        let (source, target) = (self.local_path(old), self.local_path(new));
        if source.symlink_metadata().is_err() {
            // The move already happened locally (or never reached us)
            debug!(old = %old, new = %new, "rename source gone, creating or updating target");
            return if is_directory {
                self.create_or_update_directory(new).await
            } else {
                self.create_or_update_file(new).await
            };
        }
        self.filter
            .move_entry(&source, &target)
            .await
            .with_context(|| format!("moving {old} -> {new}"))?;
        let handle = self.open_with_retry(&target, HandleMode::Plain).await?;
        self.filter.set_in_sync(&handle, true).await?;
        info!(old = %old, new = %new, "placeholder renamed");
        Ok(())
    }

    /// Remove a local placeholder (file or tree). The remote is not touched.
    pub async fn delete(&self, relative: &str) -> Result<()> {
        self.filter
            .delete_entry(&self.local_path(relative))
            .await
            .with_context(|| format!("deleting placeholder {relative}"))?;
        debug!(path = %relative, "placeholder deleted");
        Ok(())
    }

    pub async fn delete_bulk(&self, relatives: &[String]) -> usize {
        let mut deleted = 0;
        for rel in relatives {
            match self.delete(rel).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(path = %rel, "delete failed: {e:#}"),
            }
        }
        deleted
    }

    pub async fn hydrate(&self, relative: &str) -> Result<()> {
        self.filter
            .hydrate(&self.local_path(relative))
            .await
            .with_context(|| format!("hydrating {relative}"))
    }

    /// Hydrate every not-fully-present file under `relative`.
    pub async fn hydrate_tree(&self, relative: &str) -> Result<usize> {
        let mut hydrated = 0;
        let mut pending = vec![self.local_path(relative)];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("reading {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let Some(info) = self.filter.info(&path)? else {
                    continue;
                };
                if info.is_directory {
                    pending.push(path);
                } else if info.is_placeholder && !info.is_fully_present() {
                    match self.filter.hydrate(&path).await {
                        Ok(()) => hydrated += 1,
                        Err(e) => warn!(path = %path.display(), "hydration failed: {e}"),
                    }
                }
            }
        }
        Ok(hydrated)
    }

    pub async fn dehydrate(&self, relative: &str) -> Result<()> {
        let path = self.local_path(relative);
        let handle = self.open_with_retry(&path, HandleMode::Plain).await?;
        self.filter
            .dehydrate(&handle)
            .await
            .with_context(|| format!("dehydrating {relative}"))?;
        info!(path = %relative, "placeholder dehydrated");
        Ok(())
    }
}
