//! Connection to the placeholder layer for one sync root, and the callbacks
//! it raises.
//!
//! Callbacks run on the platform's tasks, concurrently with the task queue.
//! Rename and delete completions take path locks so they cannot interleave
//! with queued work on the same paths. Fetch-data never locks: an update
//! holding a path's lock may itself be waiting on a recall of that file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use cfsync_cloudfilter::{
    CancelFetchDataRequest, CloudFilter, CloudFilterError, ConnectionKey, FetchDataRequest,
    FetchPlaceholdersRequest, NotifyDeleteRequest, NotifyRenameRequest, PlaceholderDescriptor,
    SyncCallbacks, TransferKey,
};
use cfsync_core::{SyncProviderContext, SyncSettings};
use cfsync_remote::RemoteBackend;
use tracing::{debug, error, info, warn};

use crate::locker::FileLocker;
use crate::metrics::SyncMetrics;
use crate::placeholders::PlaceholdersService;

const SOURCE: &str = "connector";

pub struct SyncRootConnector {
    context: Arc<SyncProviderContext>,
    filter: Arc<dyn CloudFilter>,
    remote: RemoteBackend,
    placeholders: Arc<PlaceholdersService>,
    locker: FileLocker,
    settings: SyncSettings,
    metrics: SyncMetrics,
    connection: Mutex<Option<ConnectionKey>>,
    /// In-flight data transfers and whether the platform withdrew them.
    transfers: Mutex<HashMap<TransferKey, bool>>,
}

impl SyncRootConnector {
    pub fn new(
        context: Arc<SyncProviderContext>,
        filter: Arc<dyn CloudFilter>,
        remote: RemoteBackend,
        placeholders: Arc<PlaceholdersService>,
        locker: FileLocker,
        settings: SyncSettings,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            context,
            filter,
            remote,
            placeholders,
            locker,
            settings,
            metrics,
            connection: Mutex::new(None),
            transfers: Mutex::new(HashMap::new()),
        }
    }

    /// Hand this connector to the platform as the root's callback table.
    /// It stays referenced until [`disconnect`](Self::disconnect).
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectionKey> {
        let callbacks: Arc<dyn SyncCallbacks> = self.clone();
        let key = self
            .filter
            .connect(&self.context.root, callbacks)
            .await
            .with_context(|| format!("connecting sync root {}", self.context.root.display()))?;
        *self.connection_slot() = Some(key);
        info!(root = %self.context.id, "connected to placeholder layer");
        Ok(key)
    }

    pub async fn disconnect(&self) -> Result<()> {
        let key = self.connection_slot().take();
        if let Some(key) = key {
            self.filter.disconnect(key).await?;
            info!(root = %self.context.id, "disconnected from placeholder layer");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection_slot().is_some()
    }

    fn connection_slot(&self) -> std::sync::MutexGuard<'_, Option<ConnectionKey>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Data transfers currently being served.
    pub fn active_transfers(&self) -> usize {
        self.transfer_table().len()
    }

    fn transfer_table(&self) -> std::sync::MutexGuard<'_, HashMap<TransferKey, bool>> {
        self.transfers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn relative(&self, path: &Path) -> Option<String> {
        self.context.relative_path(path)
    }

    async fn serve_placeholders(&self, request: &FetchPlaceholdersRequest) -> Result<usize> {
        let rel = self
            .relative(&request.directory)
            .with_context(|| format!("{} is outside the sync root", request.directory.display()))?;
        let entries = self
            .remote
            .read
            .try_enumerate(&rel, &request.pattern)
            .await
            .with_context(|| format!("listing remote {rel:?}"))?;
        let descriptors: Vec<PlaceholderDescriptor> = entries
            .iter()
            .filter(|e| !self.placeholders.is_excluded(e.relative_path()))
            .map(PlaceholderDescriptor::from_remote)
            .collect();
        self.filter
            .transfer_placeholders(request.transfer, &descriptors)
            .await?;
        Ok(descriptors.len())
    }

    /// Stream the requested range in chunk-sized pieces. `Ok(false)` when
    /// the platform withdrew the request.
    async fn serve_data(&self, request: &FetchDataRequest) -> Result<bool> {
        let rel = self
            .relative(&request.path)
            .with_context(|| format!("{} is outside the sync root", request.path.display()))?;
        let chunk = self.settings.transfer_chunk_size.max(1) as u64;
        let end = request.offset + request.length;
        let mut offset = request.offset;
        while offset < end {
            if self.transfer_table().get(&request.transfer) == Some(&true) {
                return Ok(false);
            }
            let len = chunk.min(end - offset);
            let data = self.remote.read.read_range(&rel, offset, len).await?;
            if data.is_empty() {
                anyhow::bail!("remote {rel} ended at {offset}, expected {end}");
            }
            match self.filter.transfer_data(request.transfer, offset, &data).await {
                Ok(()) => {}
                Err(CloudFilterError::Cancelled) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            offset += data.len() as u64;
            self.metrics.hydrated_bytes.inc_by(data.len() as u64);
            self.filter
                .report_progress(request.transfer, request.length, offset - request.offset)
                .await?;
        }
        Ok(true)
    }

    async fn mirror_rename(&self, source: &Path, target: &Path) -> Result<()> {
        let Some(old) = self.relative(source) else {
            return Ok(());
        };
        let new = self
            .relative(target)
            .filter(|rel| !self.placeholders.is_excluded(rel));
        let _guards = match &new {
            Some(new) => self.locker.lock_many(&[old.as_str(), new.as_str()]).await,
            None => vec![self.locker.lock(&old).await],
        };

        let Some(entry) = self.remote.read.stat(&old).await? else {
            debug!(old = %old, "rename source not on remote, nothing to mirror");
            return Ok(());
        };
        match new {
            None => {
                // Moved out of the root (or into an excluded name)
                if entry.is_directory() {
                    self.remote.write.delete_directory(&old).await?;
                } else {
                    self.remote.write.delete_file(&old).await?;
                }
                info!(path = %old, "moved out of sync root, deleted on remote");
            }
            Some(new) => {
                if entry.is_directory() {
                    self.remote.write.move_directory(&old, &new).await?;
                } else {
                    self.remote.write.move_file(&old, &new).await?;
                }
                info!(old = %old, new = %new, "rename mirrored to remote");
            }
        }
        Ok(())
    }

    async fn mirror_delete(&self, path: &Path) -> Result<()> {
        let Some(rel) = self.relative(path) else {
            return Ok(());
        };
        // The completion can arrive before the entry is actually gone
        let mut gone = false;
        for attempt in 0..self.settings.delete_poll_attempts.max(1) {
            if path.symlink_metadata().is_err() {
                gone = true;
                break;
            }
            debug!(path = %rel, attempt, "deleted entry still present, waiting");
            tokio::time::sleep(self.settings.delete_poll_delay()).await;
        }
        if !gone && path.symlink_metadata().is_ok() {
            warn!(path = %rel, "entry still present after delete completion, leaving remote alone");
            return Ok(());
        }

        let _guard = self.locker.lock(&rel).await;
        if path.symlink_metadata().is_ok() {
            debug!(path = %rel, "entry recreated before delete was mirrored");
            return Ok(());
        }
        match self.remote.read.stat(&rel).await? {
            None => debug!(path = %rel, "already absent on remote"),
            Some(entry) if entry.is_directory() => {
                self.remote.write.delete_directory(&rel).await?;
                info!(path = %rel, "directory delete mirrored to remote");
            }
            Some(_) => {
                self.remote.write.delete_file(&rel).await?;
                info!(path = %rel, "file delete mirrored to remote");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncCallbacks for SyncRootConnector {
    async fn fetch_placeholders(&self, request: FetchPlaceholdersRequest) {
        match self.serve_placeholders(&request).await {
            Ok(count) => debug!(dir = %request.directory.display(), count, "placeholders transferred"),
            Err(e) => {
                warn!(dir = %request.directory.display(), "fetch placeholders failed: {e:#}");
                self.metrics.handler_failed(SOURCE);
                if let Err(e) = self
                    .filter
                    .fail_placeholders(request.transfer, &format!("{e:#}"))
                    .await
                {
                    error!(dir = %request.directory.display(), "failed to fail placeholder transfer: {e}");
                }
            }
        }
    }

    async fn fetch_data(&self, request: FetchDataRequest) {
        let path = request.path.display().to_string();
        self.transfer_table().insert(request.transfer, false);
        match self.serve_data(&request).await {
            Ok(true) => {
                self.metrics.hydrations.inc();
                info!(path = %path, offset = request.offset, length = request.length, "hydration complete");
            }
            Ok(false) => info!(path = %path, "fetch cancelled"),
            Err(e) => {
                warn!(path = %path, "fetch data failed: {e:#}");
                self.metrics.handler_failed(SOURCE);
                if let Err(e) = self.filter.fail_data(request.transfer, &format!("{e:#}")).await {
                    error!(path = %path, "failed to fail data transfer: {e}");
                }
            }
        }
        self.transfer_table().remove(&request.transfer);
    }

    async fn cancel_fetch_data(&self, request: CancelFetchDataRequest) {
        debug!(path = %request.path.display(), "fetch data cancel requested");
        // A cancel for a finished transfer has nothing left to stop
        if let Some(cancelled) = self.transfer_table().get_mut(&request.transfer) {
            *cancelled = true;
        }
    }

    async fn notify_rename(&self, request: NotifyRenameRequest) {
        debug!(
            source = %request.source.display(),
            target = %request.target.display(),
            "rename requested"
        );
        if let Err(e) = self.filter.ack_rename(request.transfer, true).await {
            error!(source = %request.source.display(), "rename ack failed: {e}");
        }
    }

    async fn notify_delete(&self, request: NotifyDeleteRequest) {
        debug!(path = %request.path.display(), "delete requested");
        if let Err(e) = self.filter.ack_delete(request.transfer, true).await {
            error!(path = %request.path.display(), "delete ack failed: {e}");
        }
    }

    async fn on_rename_completion(&self, source: PathBuf, target: PathBuf) {
        if let Err(e) = self.mirror_rename(&source, &target).await {
            warn!(
                source = %source.display(),
                target = %target.display(),
                "mirroring rename failed: {e:#}"
            );
            self.metrics.handler_failed(SOURCE);
        }
    }

    async fn on_delete_completion(&self, path: PathBuf) {
        if let Err(e) = self.mirror_delete(&path).await {
            warn!(path = %path.display(), "mirroring delete failed: {e:#}");
            self.metrics.handler_failed(SOURCE);
        }
    }

    async fn on_close_completion(&self, path: PathBuf) {
        debug!(path = %path.display(), "file closed");
    }
}
