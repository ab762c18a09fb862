//! Portable emulation of the cloud-files platform over a plain directory.
//!
//! Placeholders are ordinary files and directories. A dehydrated file is a
//! sparse file of its remote length; the sync-state bits, in-sync flag,
//! present byte ranges and population flag live in the
//! [`PlaceholderStore`]. Callbacks are dispatched on spawned tasks, the way
//! the native layer calls back on its own threads.
//!
//! Besides the [`CloudFilter`] operations the engine uses, this type exposes
//! the triggers a user's shell would generate: [`open_file`],
//! [`list_directory`], [`rename`], [`delete`], [`close_file`],
//! [`user_set_pin_state`] and [`hold_external_lock`].
//!
//! [`open_file`]: LocalCloudFilter::open_file
//! [`list_directory`]: LocalCloudFilter::list_directory
//! [`rename`]: LocalCloudFilter::rename
//! [`delete`]: LocalCloudFilter::delete
//! [`close_file`]: LocalCloudFilter::close_file
//! [`user_set_pin_state`]: LocalCloudFilter::user_set_pin_state
//! [`hold_external_lock`]: LocalCloudFilter::hold_external_lock

use std::collections::HashMap;
use std::fs::{File, FileTimes, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use cfsync_core::fingerprint::{to_filetime, truncate_to_filetime};
use cfsync_core::{FileAttributes, PinState, SyncRootRegistration};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{CfResult, CloudFilterError};
use crate::filter::{
    CancelFetchDataRequest, CloudFilter, ConnectionKey, FetchDataRequest,
    FetchPlaceholdersRequest, HandleMode, Hydration, NotifyDeleteRequest, NotifyRenameRequest,
    PlaceholderDescriptor, PlaceholderHandle, PlaceholderInfo, PlaceholderMetadata,
    SyncCallbacks, TransferKey, UpdateFlags,
};
use crate::store::{covers, path_key, PlaceholderRecord, PlaceholderStore};

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);

struct Connection {
    root: PathBuf,
    callbacks: Arc<dyn SyncCallbacks>,
}

struct DataTransfer {
    path: PathBuf,
    start: u64,
    end: u64,
    cancelled: bool,
    done: Option<oneshot::Sender<CfResult<()>>>,
}

enum Pending {
    Placeholders {
        directory: PathBuf,
        done: Option<oneshot::Sender<CfResult<()>>>,
    },
    Data(DataTransfer),
    Ack {
        done: Option<oneshot::Sender<bool>>,
    },
}

struct Inner {
    store: Mutex<PlaceholderStore>,
    roots: Mutex<HashMap<String, SyncRootRegistration>>,
    connections: Mutex<HashMap<u64, Connection>>,
    transfers: Mutex<HashMap<u64, Pending>>,
    external_locks: Mutex<HashMap<String, usize>>,
    next_id: AtomicU64,
    metadata_updates: AtomicU64,
    progress_reports: AtomicU64,
    ack_timeout: Duration,
}

#[derive(Clone)]
pub struct LocalCloudFilter {
    inner: Arc<Inner>,
}

/// Simulates another process holding a file open. Released on drop.
pub struct ExternalLock {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for ExternalLock {
    fn drop(&mut self) {
        let mut locks = lock(&self.inner.external_locks);
        if let Some(count) = locks.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn modified_of(meta: &std::fs::Metadata) -> SystemTime {
    meta.modified()
        .map(truncate_to_filetime)
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn set_file_times(path: &Path, modified: SystemTime, accessed: SystemTime) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_times(FileTimes::new().set_modified(modified).set_accessed(accessed))
}

/// Drop all content, leaving a sparse file of `length` bytes.
fn reset_sparse(path: &Path, length: u64, modified: SystemTime) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(0)?;
    file.set_len(length)?;
    file.set_times(FileTimes::new().set_modified(modified))
}

fn write_at(path: &Path, offset: u64, data: &[u8], modified: SystemTime) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.set_times(FileTimes::new().set_modified(modified))
}

impl LocalCloudFilter {
    /// Open the emulation with its placeholder store at `state_file`.
    pub fn open(state_file: &Path) -> anyhow::Result<Self> {
        let store = PlaceholderStore::open(state_file)?;
        info!(store = %state_file.display(), records = store.len(), "cloud filter emulation ready");
        Ok(Self {
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                roots: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                transfers: Mutex::new(HashMap::new()),
                external_locks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                metadata_updates: AtomicU64::new(0),
                progress_reports: AtomicU64::new(0),
                ack_timeout: DEFAULT_ACK_TIMEOUT,
            }),
        })
    }

    /// Placeholder metadata mutations applied so far (update + convert).
    pub fn metadata_updates(&self) -> u64 {
        self.inner.metadata_updates.load(Ordering::SeqCst)
    }

    pub fn progress_reports(&self) -> u64 {
        self.inner.progress_reports.load(Ordering::SeqCst)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        lock(&self.inner.store).flush()
    }

    fn store(&self) -> MutexGuard<'_, PlaceholderStore> {
        lock(&self.inner.store)
    }

    fn transfers(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        lock(&self.inner.transfers)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn connection_for(&self, path: &Path) -> Option<(ConnectionKey, PathBuf, Arc<dyn SyncCallbacks>)> {
        let key = path_key(path);
        lock(&self.inner.connections)
            .iter()
            .find(|(_, c)| {
                let root = path_key(&c.root);
                key == root || key.starts_with(&format!("{root}/"))
            })
            .map(|(id, c)| (ConnectionKey(*id), c.root.clone(), c.callbacks.clone()))
    }

    fn is_externally_locked(&self, path: &Path) -> bool {
        lock(&self.inner.external_locks).contains_key(&path_key(path))
    }

    fn with_record<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut PlaceholderRecord) -> CfResult<T>,
    ) -> CfResult<T> {
        let mut store = self.store();
        match store.get_mut(path) {
            Some(record) => f(record),
            None => Err(CloudFilterError::NotAPlaceholder(path.to_path_buf())),
        }
    }

    fn complete_ack(&self, transfer: TransferKey, allow: bool, op: &'static str) -> CfResult<()> {
        match self.transfers().remove(&transfer.0) {
            Some(Pending::Ack { done: Some(done) }) => {
                let _ = done.send(allow);
                Ok(())
            }
            _ => Err(CloudFilterError::status(op, "unknown transfer key")),
        }
    }

    /// Called once a fetch callback returns. Anything still pending was never
    /// answered and must not hang the requester.
    fn finish_transfer(&self, transfer: TransferKey, op: &'static str) {
        let pending = self.transfers().remove(&transfer.0);
        let unanswered = CloudFilterError::status(op, "callback returned without completing");
        match pending {
            Some(Pending::Data(DataTransfer {
                done: Some(done), ..
            }))
            | Some(Pending::Placeholders {
                done: Some(done), ..
            }) => {
                let _ = done.send(Err(unanswered));
            }
            _ => {}
        }
    }

    async fn request_data(&self, path: &Path, offset: u64, length: u64, file_length: u64) -> CfResult<()> {
        let (connection, _, callbacks) = self
            .connection_for(path)
            .ok_or_else(|| CloudFilterError::NotConnected(path.to_path_buf()))?;
        let transfer = TransferKey(self.next_id());
        let (tx, rx) = oneshot::channel();
        self.transfers().insert(
            transfer.0,
            Pending::Data(DataTransfer {
                path: path.to_path_buf(),
                start: offset,
                end: offset + length,
                cancelled: false,
                done: Some(tx),
            }),
        );
        let request = FetchDataRequest {
            connection,
            transfer,
            path: path.to_path_buf(),
            offset,
            length,
            file_length,
        };
        let this = self.clone();
        tokio::spawn(async move {
            callbacks.fetch_data(request).await;
            this.finish_transfer(transfer, "fetch data");
        });
        rx.await
            .unwrap_or_else(|_| Err(CloudFilterError::status("fetch data", "request dropped")))
    }

    /// Ask the provider to approve a namespace change. Unconnected roots and
    /// untracked entries need no approval.
    async fn request_ack(
        &self,
        path: &Path,
        op: &'static str,
        notify: impl FnOnce(ConnectionKey, TransferKey, Arc<dyn SyncCallbacks>),
    ) -> CfResult<Option<Arc<dyn SyncCallbacks>>> {
        if self.store().get(path).is_none() {
            return Ok(None);
        }
        let Some((connection, _, callbacks)) = self.connection_for(path) else {
            return Ok(None);
        };
        let transfer = TransferKey(self.next_id());
        let (tx, rx) = oneshot::channel();
        self.transfers()
            .insert(transfer.0, Pending::Ack { done: Some(tx) });
        notify(connection, transfer, callbacks.clone());
        let allowed = tokio::time::timeout(self.inner.ack_timeout, rx).await;
        self.transfers().remove(&transfer.0);
        match allowed {
            Ok(Ok(true)) => Ok(Some(callbacks)),
            Ok(Ok(false)) => Err(CloudFilterError::status(op, "denied by provider")),
            _ => Err(CloudFilterError::status(op, "provider did not acknowledge")),
        }
    }

    // ── Shell-side triggers ─────────────────────────────────────────────

    /// Open a file for reading, hydrating it first if it is not fully present.
    pub async fn open_file(&self, path: &Path) -> CfResult<File> {
        if self.is_externally_locked(path) {
            return Err(CloudFilterError::InUse(path.to_path_buf()));
        }
        if let Some(info) = self.info(path)? {
            if info.is_placeholder && !info.is_directory && !info.is_fully_present() {
                debug!(path = %path.display(), "recall on open");
                self.request_data(path, 0, info.length, info.length).await?;
            }
        }
        Ok(File::open(path)?)
    }

    /// Open, read everything, close.
    pub async fn read_file(&self, path: &Path) -> CfResult<Vec<u8>> {
        let mut file = self.open_file(path).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        drop(file);
        self.close_file(path);
        Ok(buf)
    }

    /// Read part of a file. Only the missing part of the range is recalled,
    /// so the file may stay partially present.
    pub async fn read_range(&self, path: &Path, offset: u64, length: u64) -> CfResult<Vec<u8>> {
        if self.is_externally_locked(path) {
            return Err(CloudFilterError::InUse(path.to_path_buf()));
        }
        if let Some(info) = self.info(path)? {
            let end = (offset + length).min(info.length);
            let missing = matches!(
                self.store().get(path),
                Some(r) if !r.is_directory && !covers(&r.present, offset, end)
            );
            if info.is_placeholder && missing && end > offset {
                debug!(path = %path.display(), offset, length = end - offset, "recall on range read");
                self.request_data(path, offset, end - offset, info.length).await?;
            }
        }
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(length).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn close_file(&self, path: &Path) {
        if self.store().get(path).is_none() {
            return;
        }
        if let Some((_, _, callbacks)) = self.connection_for(path) {
            let path = path.to_path_buf();
            tokio::spawn(async move { callbacks.on_close_completion(path).await });
        }
    }

    /// Enumerate a directory. An unpopulated placeholder directory first asks
    /// the provider for its children.
    pub async fn list_directory(&self, dir: &Path) -> CfResult<Vec<String>> {
        let needs_population = matches!(
            self.store().get(dir),
            Some(r) if r.is_directory && !r.populated && !r.on_demand_disabled
        );
        if needs_population {
            if let Some((connection, _, callbacks)) = self.connection_for(dir) {
                let transfer = TransferKey(self.next_id());
                let (tx, rx) = oneshot::channel();
                self.transfers().insert(
                    transfer.0,
                    Pending::Placeholders {
                        directory: dir.to_path_buf(),
                        done: Some(tx),
                    },
                );
                let request = FetchPlaceholdersRequest {
                    connection,
                    transfer,
                    directory: dir.to_path_buf(),
                    pattern: "*".into(),
                };
                let this = self.clone();
                tokio::spawn(async move {
                    callbacks.fetch_placeholders(request).await;
                    this.finish_transfer(transfer, "fetch placeholders");
                });
                rx.await.unwrap_or_else(|_| {
                    Err(CloudFilterError::status("fetch placeholders", "request dropped"))
                })?;
            }
        }
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Withdraw every in-flight fetch for `path`, as when the opener goes away.
    pub fn cancel_fetch(&self, path: &Path) {
        let key = path_key(path);
        let mut cancelled = Vec::new();
        for (id, pending) in self.transfers().iter_mut() {
            if let Pending::Data(t) = pending {
                if path_key(&t.path) == key && !t.cancelled {
                    t.cancelled = true;
                    if let Some(done) = t.done.take() {
                        let _ = done.send(Err(CloudFilterError::Cancelled));
                    }
                    cancelled.push(TransferKey(*id));
                }
            }
        }
        if let Some((connection, _, callbacks)) = self.connection_for(path) {
            for transfer in cancelled {
                let callbacks = callbacks.clone();
                let request = CancelFetchDataRequest {
                    connection,
                    transfer,
                    path: path.to_path_buf(),
                };
                tokio::spawn(async move { callbacks.cancel_fetch_data(request).await });
            }
        }
    }

    /// User-driven rename: notify, wait for the ack, move, then report
    /// completion.
    pub async fn rename(&self, source: &Path, target: &Path) -> CfResult<()> {
        let is_directory = source.is_dir();
        let (src, dst) = (source.to_path_buf(), target.to_path_buf());
        let callbacks = self
            .request_ack(source, "rename", |connection, transfer, callbacks| {
                let request = NotifyRenameRequest {
                    connection,
                    transfer,
                    source: src.clone(),
                    target: dst.clone(),
                    is_directory,
                };
                tokio::spawn(async move { callbacks.notify_rename(request).await });
            })
            .await?;

        std::fs::rename(source, target)?;
        {
            let same_root = self
                .connection_for(source)
                .zip(self.connection_for(target))
                .is_some_and(|(a, b)| a.0 == b.0);
            let mut store = self.store();
            if same_root {
                store.move_tree(source, target);
            } else {
                store.remove_tree(source);
            }
        }
        if let Some(callbacks) = callbacks {
            tokio::spawn(async move { callbacks.on_rename_completion(src, dst).await });
        }
        Ok(())
    }

    /// User-driven delete of a file or tree.
    pub async fn delete(&self, path: &Path) -> CfResult<()> {
        let is_directory = path.is_dir();
        let target = path.to_path_buf();
        let callbacks = self
            .request_ack(path, "delete", |connection, transfer, callbacks| {
                let request = NotifyDeleteRequest {
                    connection,
                    transfer,
                    path: target.clone(),
                    is_directory,
                };
                tokio::spawn(async move { callbacks.notify_delete(request).await });
            })
            .await?;

        if is_directory {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
        self.store().remove_tree(path);
        if let Some(callbacks) = callbacks {
            tokio::spawn(async move { callbacks.on_delete_completion(target).await });
        }
        Ok(())
    }

    /// "Always keep on this device" / "Free up space" from the shell. Pin
    /// intent is inherited by tracked descendants. The attribute change is
    /// made visible to file watchers, and pinning a file recalls it.
    pub fn user_set_pin_state(&self, path: &Path, pin: PinState) -> CfResult<()> {
        let is_directory = {
            let mut store = self.store();
            let record = store
                .get_mut(path)
                .ok_or_else(|| CloudFilterError::NotAPlaceholder(path.to_path_buf()))?;
            record.set_attributes(record.attributes().with_pin_state(pin));
            let is_directory = record.is_directory;
            if is_directory {
                let children: Vec<PathBuf> = store
                    .descendants(path)
                    .map(|(k, _)| PathBuf::from(k))
                    .collect();
                for child in children {
                    if let Some(r) = store.get_mut(&child) {
                        r.set_attributes(r.attributes().with_pin_state(pin));
                    }
                }
            }
            is_directory
        };

        // chmod to the current mode: bumps ctime so watchers see an attribute event
        let perms = std::fs::metadata(path)?.permissions();
        std::fs::set_permissions(path, perms)?;

        if pin == PinState::Pinned && !is_directory {
            let this = self.clone();
            let path = path.to_path_buf();
            tokio::spawn(async move {
                if let Err(e) = this.hydrate(&path).await {
                    warn!(path = %path.display(), "recall of pinned file failed: {e}");
                }
            });
        }
        Ok(())
    }

    pub fn hold_external_lock(&self, path: &Path) -> ExternalLock {
        let key = path_key(path);
        *lock(&self.inner.external_locks).entry(key.clone()).or_insert(0) += 1;
        ExternalLock {
            inner: self.inner.clone(),
            key,
        }
    }

    fn create_one(&self, parent: &Path, entry: &PlaceholderDescriptor) -> CfResult<bool> {
        let path = parent.join(&entry.name);
        if path.symlink_metadata().is_ok() {
            debug!(path = %path.display(), "placeholder already exists, skipping");
            return Ok(false);
        }
        let meta = &entry.metadata;
        let mut attributes = meta.attributes.identity_bits();
        if meta.is_directory {
            attributes |= FileAttributes::DIRECTORY;
        }
        let mut record = PlaceholderRecord {
            is_directory: meta.is_directory,
            attributes: attributes.bits(),
            in_sync: entry.mark_in_sync,
            length: if meta.is_directory { 0 } else { meta.length },
            modified: 0,
            present: Vec::new(),
            populated: entry.disable_on_demand_population,
            on_demand_disabled: entry.disable_on_demand_population,
        };
        record.set_modified(meta.modified);
        // Record first: a watcher reacting to the new file must already see a placeholder.
        self.store().set(&path, record);

        let created = if meta.is_directory {
            std::fs::create_dir(&path)
        } else {
            File::create(&path)
                .and_then(|f| f.set_len(meta.length))
                .and_then(|_| set_file_times(&path, meta.modified, meta.accessed))
        };
        if let Err(e) = created {
            self.store().remove_tree(&path);
            return Err(e.into());
        }
        Ok(true)
    }
}

#[async_trait]
impl CloudFilter for LocalCloudFilter {
    async fn register_sync_root(&self, registration: &SyncRootRegistration) -> CfResult<()> {
        let root = &registration.local_path;
        tokio::fs::create_dir_all(root).await?;
        {
            let mut store = self.store();
            if store.get(root).is_none() {
                let mut record = PlaceholderRecord {
                    is_directory: true,
                    attributes: FileAttributes::DIRECTORY.bits(),
                    in_sync: true,
                    length: 0,
                    modified: 0,
                    present: Vec::new(),
                    populated: false,
                    on_demand_disabled: false,
                };
                record.set_modified(SystemTime::now());
                store.set(root, record);
            }
        }
        lock(&self.inner.roots).insert(path_key(root), registration.clone());
        info!(
            root = %root.display(),
            id = %registration.id,
            name = %registration.display_name,
            "sync root registered"
        );
        Ok(())
    }

    async fn unregister_sync_root(&self, root: &Path) -> CfResult<()> {
        lock(&self.inner.roots).remove(&path_key(root));
        self.store().remove_tree(root);
        info!(root = %root.display(), "sync root unregistered");
        Ok(())
    }

    async fn connect(
        &self,
        root: &Path,
        callbacks: Arc<dyn SyncCallbacks>,
    ) -> CfResult<ConnectionKey> {
        if !lock(&self.inner.roots).contains_key(&path_key(root)) {
            return Err(CloudFilterError::NotConnected(root.to_path_buf()));
        }
        let key = ConnectionKey(self.next_id());
        lock(&self.inner.connections).insert(
            key.0,
            Connection {
                root: root.to_path_buf(),
                callbacks,
            },
        );
        info!(root = %root.display(), connection = key.0, "sync root connected");
        Ok(key)
    }

    async fn disconnect(&self, key: ConnectionKey) -> CfResult<()> {
        let removed = lock(&self.inner.connections).remove(&key.0);
        let Some(connection) = removed else {
            return Err(CloudFilterError::status("disconnect", "unknown connection"));
        };
        // Fail whatever the provider can no longer answer
        let root = path_key(&connection.root);
        let mut transfers = self.transfers();
        let orphaned: Vec<u64> = transfers
            .iter()
            .filter(|(_, p)| match p {
                Pending::Data(t) => path_key(&t.path).starts_with(&root),
                Pending::Placeholders { directory, .. } => path_key(directory).starts_with(&root),
                Pending::Ack { .. } => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            match transfers.remove(&id) {
                Some(Pending::Data(DataTransfer { done: Some(done), .. }))
                | Some(Pending::Placeholders { done: Some(done), .. }) => {
                    let _ = done.send(Err(CloudFilterError::NotConnected(connection.root.clone())));
                }
                _ => {}
            }
        }
        drop(transfers);
        if let Err(e) = self.flush() {
            warn!("placeholder store flush on disconnect failed: {e:#}");
        }
        info!(root = %connection.root.display(), "sync root disconnected");
        Ok(())
    }

    async fn create_placeholders(
        &self,
        parent: &Path,
        entries: &[PlaceholderDescriptor],
    ) -> CfResult<()> {
        if !parent.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("parent directory missing: {}", parent.display()),
            )
            .into());
        }
        for entry in entries {
            self.create_one(parent, entry)?;
        }
        Ok(())
    }

    async fn transfer_placeholders(
        &self,
        transfer: TransferKey,
        entries: &[PlaceholderDescriptor],
    ) -> CfResult<()> {
        let directory = match self.transfers().get(&transfer.0) {
            Some(Pending::Placeholders { directory, .. }) => directory.clone(),
            _ => {
                return Err(CloudFilterError::status(
                    "transfer placeholders",
                    "unknown transfer key",
                ))
            }
        };
        for entry in entries {
            self.create_one(&directory, entry)?;
        }
        if let Some(record) = self.store().get_mut(&directory) {
            record.populated = true;
        }
        if let Some(Pending::Placeholders { done, .. }) = self.transfers().get_mut(&transfer.0) {
            if let Some(done) = done.take() {
                let _ = done.send(Ok(()));
            }
        }
        Ok(())
    }

    async fn fail_placeholders(&self, transfer: TransferKey, reason: &str) -> CfResult<()> {
        match self.transfers().remove(&transfer.0) {
            Some(Pending::Placeholders { done, .. }) => {
                if let Some(done) = done {
                    let _ = done.send(Err(CloudFilterError::status(
                        "fetch placeholders",
                        reason,
                    )));
                }
                Ok(())
            }
            _ => Err(CloudFilterError::status(
                "fail placeholders",
                "unknown transfer key",
            )),
        }
    }

    async fn transfer_data(&self, transfer: TransferKey, offset: u64, data: &[u8]) -> CfResult<()> {
        let (path, start, end) = match self.transfers().get(&transfer.0) {
            Some(Pending::Data(t)) if t.cancelled => return Err(CloudFilterError::Cancelled),
            Some(Pending::Data(t)) => (t.path.clone(), t.start, t.end),
            _ => return Err(CloudFilterError::status("transfer data", "unknown transfer key")),
        };
        let modified = self
            .store()
            .get(&path)
            .map(|r| r.modified())
            .ok_or_else(|| CloudFilterError::NotAPlaceholder(path.clone()))?;

        write_at(&path, offset, data, modified)?;

        let complete = self.with_record(&path, |record| {
            record.mark_present(offset, offset + data.len() as u64);
            Ok(covers(&record.present, start, end.min(record.length)))
        })?;
        if complete {
            if let Some(Pending::Data(t)) = self.transfers().get_mut(&transfer.0) {
                if let Some(done) = t.done.take() {
                    debug!(path = %path.display(), "fetch data complete");
                    let _ = done.send(Ok(()));
                }
            }
        }
        Ok(())
    }

    async fn fail_data(&self, transfer: TransferKey, reason: &str) -> CfResult<()> {
        match self.transfers().remove(&transfer.0) {
            Some(Pending::Data(t)) => {
                if let Some(done) = t.done {
                    let _ = done.send(Err(CloudFilterError::status("fetch data", reason)));
                }
                Ok(())
            }
            _ => Err(CloudFilterError::status("fail data", "unknown transfer key")),
        }
    }

    async fn report_progress(&self, transfer: TransferKey, total: u64, completed: u64) -> CfResult<()> {
        self.inner.progress_reports.fetch_add(1, Ordering::SeqCst);
        debug!(transfer = transfer.0, total, completed, "transfer progress");
        Ok(())
    }

    async fn ack_rename(&self, transfer: TransferKey, allow: bool) -> CfResult<()> {
        self.complete_ack(transfer, allow, "ack rename")
    }

    async fn ack_delete(&self, transfer: TransferKey, allow: bool) -> CfResult<()> {
        self.complete_ack(transfer, allow, "ack delete")
    }

    fn info(&self, path: &Path) -> CfResult<Option<PlaceholderInfo>> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let disk_modified = modified_of(&meta);
        let created = meta.created().map(truncate_to_filetime).unwrap_or(disk_modified);
        let accessed = meta.accessed().map(truncate_to_filetime).unwrap_or(disk_modified);

        let store = self.store();
        let Some(record) = store.get(path) else {
            return Ok(Some(PlaceholderInfo {
                path: path.to_path_buf(),
                is_directory: meta.is_dir(),
                is_placeholder: false,
                in_sync: false,
                hydration: Hydration::Full,
                attributes: FileAttributes::for_entry(meta.is_dir()),
                length: if meta.is_dir() { 0 } else { meta.len() },
                created,
                modified: disk_modified,
                accessed,
                populated: true,
            }));
        };

        let mut attributes = record.attributes() | FileAttributes::REPARSE_POINT;
        let info = if record.is_directory {
            let offline = !record.populated
                || store.descendants(path).any(|(_, r)| {
                    if r.is_directory {
                        !r.populated
                    } else {
                        !r.is_fully_present()
                    }
                });
            attributes |= FileAttributes::DIRECTORY;
            if offline {
                attributes |= FileAttributes::OFFLINE;
            }
            PlaceholderInfo {
                path: path.to_path_buf(),
                is_directory: true,
                is_placeholder: true,
                in_sync: record.in_sync,
                hydration: if offline { Hydration::Partial } else { Hydration::Full },
                attributes,
                length: 0,
                created,
                modified: record.modified(),
                accessed,
                populated: record.populated,
            }
        } else {
            let hydration = if record.is_fully_present() {
                Hydration::Full
            } else if record.present.is_empty() {
                Hydration::None
            } else {
                Hydration::Partial
            };
            attributes |= FileAttributes::SPARSE_FILE;
            if hydration != Hydration::Full {
                attributes |= FileAttributes::OFFLINE | FileAttributes::RECALL_ON_DATA_ACCESS;
            }
            let in_sync = record.in_sync
                && meta.len() == record.length
                && to_filetime(disk_modified) == record.modified;
            PlaceholderInfo {
                path: path.to_path_buf(),
                is_directory: false,
                is_placeholder: true,
                in_sync,
                hydration,
                attributes,
                length: meta.len(),
                created,
                modified: disk_modified,
                accessed,
                populated: true,
            }
        };
        Ok(Some(info))
    }

    fn open(&self, path: &Path, mode: HandleMode) -> CfResult<PlaceholderHandle> {
        if self.is_externally_locked(path) {
            return Err(CloudFilterError::InUse(path.to_path_buf()));
        }
        if std::fs::symlink_metadata(path).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such entry: {}", path.display()),
            )
            .into());
        }
        Ok(PlaceholderHandle::new(path.to_path_buf(), mode))
    }

    async fn convert_to_placeholder(
        &self,
        handle: &PlaceholderHandle,
        mark_in_sync: bool,
    ) -> CfResult<()> {
        let path = handle.path();
        let meta = std::fs::metadata(path)?;
        let mut store = self.store();
        if let Some(record) = store.get_mut(path) {
            if mark_in_sync {
                record.in_sync = true;
            }
            return Ok(());
        }
        let length = if meta.is_dir() { 0 } else { meta.len() };
        let mut record = PlaceholderRecord {
            is_directory: meta.is_dir(),
            attributes: FileAttributes::for_entry(meta.is_dir()).bits(),
            in_sync: mark_in_sync,
            length,
            modified: to_filetime(modified_of(&meta)),
            present: Vec::new(),
            populated: true,
            on_demand_disabled: true,
        };
        record.mark_present(0, length);
        store.set(path, record);
        self.inner.metadata_updates.fetch_add(1, Ordering::SeqCst);
        debug!(path = %path.display(), mark_in_sync, "converted to placeholder");
        Ok(())
    }

    async fn update_placeholder(
        &self,
        handle: &PlaceholderHandle,
        metadata: Option<&PlaceholderMetadata>,
        flags: UpdateFlags,
    ) -> CfResult<()> {
        let path = handle.path();
        let (is_directory, length, modified, reset) = self.with_record(path, |record| {
            if flags.dehydrate
                && !record.is_directory
                && record.attributes().pin_state() == PinState::Pinned
            {
                return Err(CloudFilterError::Pinned(path.to_path_buf()));
            }
            let mut reset = flags.dehydrate && !record.is_directory;
            if let Some(meta) = metadata {
                let pin = record.attributes().pin_state();
                let mut attributes = meta.attributes.identity_bits().with_pin_state(pin);
                if record.is_directory {
                    attributes |= FileAttributes::DIRECTORY;
                }
                record.set_attributes(attributes);
                if !record.is_directory && meta.length != record.length {
                    // Stale content cannot be kept across a size change
                    reset = true;
                }
                record.length = if record.is_directory { 0 } else { meta.length };
                record.set_modified(meta.modified);
            }
            if reset {
                record.present.clear();
            }
            if flags.mark_in_sync {
                record.in_sync = true;
            }
            if flags.disable_on_demand_population && record.is_directory {
                record.populated = true;
                record.on_demand_disabled = true;
            }
            Ok((record.is_directory, record.length, record.modified(), reset))
        })?;

        if !is_directory {
            if reset {
                reset_sparse(path, length, modified)?;
            } else if metadata.is_some() {
                set_file_times(path, modified, modified)?;
            }
        }
        self.inner.metadata_updates.fetch_add(1, Ordering::SeqCst);
        debug!(path = %path.display(), ?flags, "placeholder updated");
        Ok(())
    }

    async fn hydrate(&self, path: &Path) -> CfResult<()> {
        let Some(info) = self.info(path)? else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such entry: {}", path.display()),
            )
            .into());
        };
        if !info.is_placeholder || info.is_directory || info.is_fully_present() {
            return Ok(());
        }
        self.request_data(path, 0, info.length, info.length).await
    }

    async fn dehydrate(&self, handle: &PlaceholderHandle) -> CfResult<()> {
        let path = handle.path();
        let (length, modified) = self.with_record(path, |record| {
            if record.is_directory {
                return Err(CloudFilterError::status("dehydrate", "not a file"));
            }
            if record.attributes().pin_state() == PinState::Pinned {
                return Err(CloudFilterError::Pinned(path.to_path_buf()));
            }
            record.present.clear();
            Ok((record.length, record.modified()))
        })?;
        reset_sparse(path, length, modified)?;
        debug!(path = %path.display(), "dehydrated");
        Ok(())
    }

    async fn set_in_sync(&self, handle: &PlaceholderHandle, in_sync: bool) -> CfResult<()> {
        let path = handle.path();
        let meta = std::fs::metadata(path)?;
        self.with_record(path, |record| {
            record.in_sync = in_sync;
            if in_sync && !record.is_directory {
                // Adopt what is on disk as the synced state
                let was_full = record.is_fully_present();
                record.length = meta.len();
                record.set_modified(modified_of(&meta));
                if was_full {
                    record.present.clear();
                    record.mark_present(0, record.length);
                }
            }
            Ok(())
        })
    }

    async fn set_pin_state(&self, handle: &PlaceholderHandle, pin: PinState) -> CfResult<()> {
        self.with_record(handle.path(), |record| {
            record.set_attributes(record.attributes().with_pin_state(pin));
            Ok(())
        })
    }

    async fn move_entry(&self, source: &Path, target: &Path) -> CfResult<()> {
        std::fs::rename(source, target)?;
        self.store().move_tree(source, target);
        Ok(())
    }

    async fn delete_entry(&self, path: &Path) -> CfResult<()> {
        let removed = match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        self.store().remove_tree(path);
        removed?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_core::{PopulationPolicy, SyncRootId};
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    /// Serves every fetch from an in-memory byte vector.
    struct StaticCallbacks {
        filter: LocalCloudFilter,
        content: Vec<u8>,
        children: Vec<PlaceholderDescriptor>,
    }

    #[async_trait]
    impl SyncCallbacks for StaticCallbacks {
        async fn fetch_placeholders(&self, request: FetchPlaceholdersRequest) {
            self.filter
                .transfer_placeholders(request.transfer, &self.children)
                .await
                .unwrap();
        }

        async fn fetch_data(&self, request: FetchDataRequest) {
            let end = (request.offset + request.length) as usize;
            for start in (request.offset as usize..end).step_by(4) {
                let stop = (start + 4).min(end);
                self.filter
                    .transfer_data(request.transfer, start as u64, &self.content[start..stop])
                    .await
                    .unwrap();
            }
        }

        async fn cancel_fetch_data(&self, _request: CancelFetchDataRequest) {}

        async fn notify_rename(&self, request: NotifyRenameRequest) {
            self.filter.ack_rename(request.transfer, true).await.unwrap();
        }

        async fn notify_delete(&self, request: NotifyDeleteRequest) {
            self.filter.ack_delete(request.transfer, false).await.unwrap();
        }

        async fn on_rename_completion(&self, _source: PathBuf, _target: PathBuf) {}

        async fn on_delete_completion(&self, _path: PathBuf) {}

        async fn on_close_completion(&self, _path: PathBuf) {}
    }

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn file_descriptor(name: &str, length: u64) -> PlaceholderDescriptor {
        PlaceholderDescriptor {
            name: name.into(),
            metadata: PlaceholderMetadata {
                is_directory: false,
                length,
                attributes: FileAttributes::ARCHIVE,
                created: t(100),
                modified: t(100),
                accessed: t(100),
            },
            mark_in_sync: true,
            disable_on_demand_population: false,
        }
    }

    async fn setup(content: &[u8]) -> (TempDir, PathBuf, LocalCloudFilter) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let filter = LocalCloudFilter::open(&tmp.path().join("state/store.json")).unwrap();
        let registration = SyncRootRegistration {
            id: SyncRootId::new("test"),
            display_name: "Test".into(),
            local_path: root.clone(),
            population_policy: PopulationPolicy::Lazy,
            context: Default::default(),
        };
        filter.register_sync_root(&registration).await.unwrap();
        let callbacks = Arc::new(StaticCallbacks {
            filter: filter.clone(),
            content: content.to_vec(),
            children: vec![file_descriptor("child.txt", content.len() as u64)],
        });
        filter.connect(&root, callbacks).await.unwrap();
        (tmp, root, filter)
    }

    #[tokio::test]
    async fn created_placeholder_is_dehydrated_and_in_sync() {
        let (_tmp, root, filter) = setup(b"0123456789").await;
        filter
            .create_placeholders(&root, &[file_descriptor("a.txt", 10)])
            .await
            .unwrap();
        let info = filter.info(&root.join("a.txt")).unwrap().unwrap();
        assert!(info.is_placeholder);
        assert!(info.in_sync);
        assert_eq!(info.hydration, Hydration::None);
        assert!(info.is_offline());
        assert_eq!(info.length, 10);
        assert_eq!(info.modified, t(100));
    }

    #[tokio::test]
    async fn open_file_recalls_content() {
        let (_tmp, root, filter) = setup(b"0123456789").await;
        filter
            .create_placeholders(&root, &[file_descriptor("a.txt", 10)])
            .await
            .unwrap();
        let data = filter.read_file(&root.join("a.txt")).await.unwrap();
        assert_eq!(data, b"0123456789");
        let info = filter.info(&root.join("a.txt")).unwrap().unwrap();
        assert!(info.is_fully_present());
        assert!(info.in_sync, "hydration must not disturb the write time");
        assert!(!info.is_offline());
    }

    #[tokio::test]
    async fn range_read_leaves_file_partially_present() {
        let (_tmp, root, filter) = setup(b"0123456789abcdef").await;
        filter
            .create_placeholders(&root, &[file_descriptor("a.txt", 16)])
            .await
            .unwrap();
        let path = root.join("a.txt");
        let data = filter.read_range(&path, 4, 4).await.unwrap();
        assert_eq!(data, b"4567");
        let info = filter.info(&path).unwrap().unwrap();
        assert_eq!(info.hydration, Hydration::Partial);
        assert!(info.is_offline());
        assert!(info.in_sync);

        assert_eq!(filter.read_file(&path).await.unwrap(), b"0123456789abcdef");
        assert!(filter.info(&path).unwrap().unwrap().is_fully_present());
    }

    #[tokio::test]
    async fn listing_unpopulated_directory_fetches_children() {
        let (_tmp, root, filter) = setup(b"abc").await;
        assert!(filter.info(&root).unwrap().unwrap().is_offline());
        let names = filter.list_directory(&root).await.unwrap();
        assert_eq!(names, vec!["child.txt".to_string()]);
        assert!(filter.info(&root).unwrap().unwrap().populated);
    }

    #[tokio::test]
    async fn pinned_file_refuses_dehydrate() {
        let (_tmp, root, filter) = setup(b"abcd").await;
        filter
            .create_placeholders(&root, &[file_descriptor("a.txt", 4)])
            .await
            .unwrap();
        let path = root.join("a.txt");
        let handle = filter.open(&path, HandleMode::Plain).unwrap();
        filter.set_pin_state(&handle, PinState::Pinned).await.unwrap();
        let err = filter.dehydrate(&handle).await.unwrap_err();
        assert!(matches!(err, CloudFilterError::Pinned(_)));
        let err = filter
            .update_placeholder(
                &handle,
                None,
                UpdateFlags {
                    dehydrate: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CloudFilterError::Pinned(_)));
    }

    #[tokio::test]
    async fn external_lock_makes_open_fail_transiently() {
        let (_tmp, root, filter) = setup(b"").await;
        std::fs::write(root.join("x"), b"1").unwrap();
        let guard = filter.hold_external_lock(&root.join("x"));
        let err = filter.open(&root.join("x"), HandleMode::Plain).unwrap_err();
        assert!(err.is_transient());
        drop(guard);
        assert!(filter.open(&root.join("x"), HandleMode::Plain).is_ok());
    }

    #[tokio::test]
    async fn local_edit_breaks_in_sync() {
        let (_tmp, root, filter) = setup(b"").await;
        let path = root.join("local.txt");
        std::fs::write(&path, b"hello").unwrap();
        let handle = filter.open(&path, HandleMode::Plain).unwrap();
        filter.convert_to_placeholder(&handle, true).await.unwrap();
        assert!(filter.info(&path).unwrap().unwrap().in_sync);

        std::fs::write(&path, b"hello, world").unwrap();
        assert!(!filter.info(&path).unwrap().unwrap().in_sync);

        filter.set_in_sync(&handle, true).await.unwrap();
        let info = filter.info(&path).unwrap().unwrap();
        assert!(info.in_sync);
        assert!(info.is_fully_present());
    }

    #[tokio::test]
    async fn denied_delete_leaves_file() {
        let (_tmp, root, filter) = setup(b"abcd").await;
        filter
            .create_placeholders(&root, &[file_descriptor("a.txt", 4)])
            .await
            .unwrap();
        let err = filter.delete(&root.join("a.txt")).await.unwrap_err();
        assert!(err.to_string().contains("denied"));
        assert!(root.join("a.txt").exists());
    }

    #[tokio::test]
    async fn rename_moves_placeholder_state() {
        let (_tmp, root, filter) = setup(b"abcd").await;
        filter
            .create_placeholders(&root, &[file_descriptor("a.txt", 4)])
            .await
            .unwrap();
        filter
            .rename(&root.join("a.txt"), &root.join("b.txt"))
            .await
            .unwrap();
        assert!(filter.info(&root.join("b.txt")).unwrap().unwrap().is_placeholder);
        assert!(filter.info(&root.join("a.txt")).unwrap().is_none());
    }
}
