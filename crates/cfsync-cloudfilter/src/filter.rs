//! The two directions of the virtual-filesystem protocol.
//!
//! [`CloudFilter`] is what the engine calls (outbound operations on
//! placeholders and pending transfers). [`SyncCallbacks`] is what the
//! platform calls back into for one connected sync root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use cfsync_core::{
    FileAttributes, Fingerprint, LocalEntryInfo, PinState, RemoteEntry, SyncRootRegistration,
};

use crate::error::CfResult;

/// Identifies one live connection between a sync root and its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(pub u64);

/// Identifies one pending platform request (fetch, rename, delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    /// Plain handle: fine for dehydrated or partially present files.
    Plain,
    /// Held open for the duration of an update so the hydrated content
    /// cannot be recalled or evicted underneath it.
    HeldOpen,
}

/// Scoped handle to a local entry. Dropped as soon as the operation that
/// opened it finishes.
#[derive(Debug)]
pub struct PlaceholderHandle {
    path: PathBuf,
    mode: HandleMode,
}

impl PlaceholderHandle {
    pub fn new(path: PathBuf, mode: HandleMode) -> Self {
        Self { path, mode }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }
}

/// How much of a file's content is on local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hydration {
    Full,
    Partial,
    None,
}

/// Metadata applied when creating or updating a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderMetadata {
    pub is_directory: bool,
    pub length: u64,
    pub attributes: FileAttributes,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl PlaceholderMetadata {
    pub fn from_remote(entry: &RemoteEntry) -> Self {
        let info = entry.info();
        Self {
            is_directory: entry.is_directory(),
            length: entry.length(),
            attributes: info.attributes.identity_bits(),
            created: info.created,
            modified: info.modified,
            accessed: info.accessed,
        }
    }
}

/// One entry of a placeholder-creation batch, named relative to its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderDescriptor {
    pub name: String,
    pub metadata: PlaceholderMetadata,
    pub mark_in_sync: bool,
    /// The directory's children will be supplied by the provider up front,
    /// so the platform must not ask for them on enumeration.
    pub disable_on_demand_population: bool,
}

impl PlaceholderDescriptor {
    pub fn from_remote(entry: &RemoteEntry) -> Self {
        Self {
            name: entry.info().name.clone(),
            metadata: PlaceholderMetadata::from_remote(entry),
            mark_in_sync: true,
            disable_on_demand_population: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags {
    /// Evict content after applying metadata.
    pub dehydrate: bool,
    pub mark_in_sync: bool,
    /// Mark a directory as fully populated by the provider.
    pub disable_on_demand_population: bool,
}

/// Snapshot of a local entry as the platform sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub path: PathBuf,
    pub is_directory: bool,
    pub is_placeholder: bool,
    pub in_sync: bool,
    pub hydration: Hydration,
    /// Native attribute bits including the sync-state vocabulary.
    pub attributes: FileAttributes,
    pub length: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    /// Directory children have been supplied (always true for files).
    pub populated: bool,
}

impl PlaceholderInfo {
    pub fn pin_state(&self) -> PinState {
        self.attributes.pin_state()
    }

    pub fn is_fully_present(&self) -> bool {
        self.hydration == Hydration::Full
    }

    pub fn is_partial(&self) -> bool {
        self.hydration == Hydration::Partial
    }

    pub fn is_offline(&self) -> bool {
        self.attributes.is_offline()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        if self.is_directory {
            Fingerprint::of_directory(self.modified, self.attributes)
        } else {
            Fingerprint::of_file(self.length, self.modified, self.attributes)
        }
    }

    pub fn to_local_entry(&self, relative_path: &str) -> LocalEntryInfo {
        LocalEntryInfo {
            path: self.path.clone(),
            relative_path: relative_path.to_string(),
            is_directory: self.is_directory,
            length: self.length,
            attributes: self.attributes,
            created: self.created,
            modified: self.modified,
            accessed: self.accessed,
        }
    }
}

/// Platform request to list a directory's children.
#[derive(Debug, Clone)]
pub struct FetchPlaceholdersRequest {
    pub connection: ConnectionKey,
    pub transfer: TransferKey,
    pub directory: PathBuf,
    pub pattern: String,
}

/// Platform request for a byte range of a not-fully-present file.
#[derive(Debug, Clone)]
pub struct FetchDataRequest {
    pub connection: ConnectionKey,
    pub transfer: TransferKey,
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
    pub file_length: u64,
}

#[derive(Debug, Clone)]
pub struct CancelFetchDataRequest {
    pub connection: ConnectionKey,
    pub transfer: TransferKey,
    pub path: PathBuf,
}

/// The platform is about to rename; the provider must ack before it proceeds.
#[derive(Debug, Clone)]
pub struct NotifyRenameRequest {
    pub connection: ConnectionKey,
    pub transfer: TransferKey,
    pub source: PathBuf,
    pub target: PathBuf,
    pub is_directory: bool,
}

/// The platform is about to delete; the provider must ack before it proceeds.
#[derive(Debug, Clone)]
pub struct NotifyDeleteRequest {
    pub connection: ConnectionKey,
    pub transfer: TransferKey,
    pub path: PathBuf,
    pub is_directory: bool,
}

/// Outbound operations the engine performs against the platform.
#[async_trait]
pub trait CloudFilter: Send + Sync {
    async fn register_sync_root(&self, registration: &SyncRootRegistration) -> CfResult<()>;

    async fn unregister_sync_root(&self, root: &Path) -> CfResult<()>;

    /// Start delivering callbacks for `root`. The callback table lives
    /// exactly as long as the returned connection.
    async fn connect(&self, root: &Path, callbacks: Arc<dyn SyncCallbacks>)
        -> CfResult<ConnectionKey>;

    async fn disconnect(&self, key: ConnectionKey) -> CfResult<()>;

    /// Create placeholders under `parent`. Existing names are left alone.
    async fn create_placeholders(
        &self,
        parent: &Path,
        entries: &[PlaceholderDescriptor],
    ) -> CfResult<()>;

    /// Answer a fetch-placeholders request.
    async fn transfer_placeholders(
        &self,
        transfer: TransferKey,
        entries: &[PlaceholderDescriptor],
    ) -> CfResult<()>;

    async fn fail_placeholders(&self, transfer: TransferKey, reason: &str) -> CfResult<()>;

    /// Deliver one chunk of a fetch-data request. Returns
    /// [`Cancelled`](crate::CloudFilterError::Cancelled) once the request
    /// has been withdrawn.
    async fn transfer_data(&self, transfer: TransferKey, offset: u64, data: &[u8])
        -> CfResult<()>;

    async fn fail_data(&self, transfer: TransferKey, reason: &str) -> CfResult<()>;

    async fn report_progress(&self, transfer: TransferKey, total: u64, completed: u64)
        -> CfResult<()>;

    async fn ack_rename(&self, transfer: TransferKey, allow: bool) -> CfResult<()>;

    async fn ack_delete(&self, transfer: TransferKey, allow: bool) -> CfResult<()>;

    /// `Ok(None)` when nothing exists at `path`.
    fn info(&self, path: &Path) -> CfResult<Option<PlaceholderInfo>>;

    /// Fails with [`InUse`](crate::CloudFilterError::InUse) while another
    /// process holds the file.
    fn open(&self, path: &Path, mode: HandleMode) -> CfResult<PlaceholderHandle>;

    async fn convert_to_placeholder(
        &self,
        handle: &PlaceholderHandle,
        mark_in_sync: bool,
    ) -> CfResult<()>;

    /// Apply metadata (when given) and flags. Dehydrating a pinned file
    /// fails with [`Pinned`](crate::CloudFilterError::Pinned).
    async fn update_placeholder(
        &self,
        handle: &PlaceholderHandle,
        metadata: Option<&PlaceholderMetadata>,
        flags: UpdateFlags,
    ) -> CfResult<()>;

    /// Bring the whole file local. Completes once the data has arrived.
    async fn hydrate(&self, path: &Path) -> CfResult<()>;

    async fn dehydrate(&self, handle: &PlaceholderHandle) -> CfResult<()>;

    async fn set_in_sync(&self, handle: &PlaceholderHandle, in_sync: bool) -> CfResult<()>;

    async fn set_pin_state(&self, handle: &PlaceholderHandle, pin: PinState) -> CfResult<()>;

    /// Provider-initiated move. Raises no callbacks.
    async fn move_entry(&self, source: &Path, target: &Path) -> CfResult<()>;

    /// Provider-initiated delete of a file or tree. Raises no callbacks.
    async fn delete_entry(&self, path: &Path) -> CfResult<()>;
}

/// Callbacks the platform raises for one connected sync root. They run on
/// the platform's own threads, concurrently with everything else.
#[async_trait]
pub trait SyncCallbacks: Send + Sync {
    async fn fetch_placeholders(&self, request: FetchPlaceholdersRequest);

    async fn fetch_data(&self, request: FetchDataRequest);

    async fn cancel_fetch_data(&self, request: CancelFetchDataRequest);

    async fn notify_rename(&self, request: NotifyRenameRequest);

    async fn notify_delete(&self, request: NotifyDeleteRequest);

    async fn on_rename_completion(&self, source: PathBuf, target: PathBuf);

    async fn on_delete_completion(&self, path: PathBuf);

    async fn on_close_completion(&self, path: PathBuf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_core::{RemoteFileInfo, RemoteFileSystemInfo};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn descriptor_from_remote_strips_sync_bits() {
        let t = UNIX_EPOCH + Duration::from_secs(5);
        let entry = RemoteEntry::File(RemoteFileInfo {
            info: RemoteFileSystemInfo::new(
                "dir/a.txt",
                FileAttributes::ARCHIVE | FileAttributes::PINNED,
                t,
            ),
            length: 7,
        });
        let d = PlaceholderDescriptor::from_remote(&entry);
        assert_eq!(d.name, "a.txt");
        assert_eq!(d.metadata.length, 7);
        assert_eq!(d.metadata.attributes, FileAttributes::ARCHIVE);
        assert!(d.mark_in_sync);
    }
}
