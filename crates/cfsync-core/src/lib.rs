pub mod attributes;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod paths;
pub mod registration;
pub mod types;

pub use attributes::{FileAttributes, PinState};
pub use config::{CfsyncConfig, RemoteConfig, SyncRootConfig, SyncSettings};
pub use error::{CfsyncError, CfsyncResult};
pub use fingerprint::Fingerprint;
pub use registration::{RemoteContextBlob, SyncRootId, SyncRootRegistration};
pub use types::{
    LocalEntryInfo, PopulationPolicy, RemoteDirectoryInfo, RemoteEntry, RemoteFileInfo,
    RemoteFileSystemInfo, RemoteKind, ShellCommand, ShellCommandKind, SyncProviderContext,
};
