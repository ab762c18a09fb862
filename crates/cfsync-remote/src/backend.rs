//! Per-root bundle of the three remote capabilities.

use std::sync::Arc;

use anyhow::Result;
use cfsync_core::{RemoteConfig, RemoteKind, SyncSettings};
use tracing::info;

use crate::memory::MemoryRemote;
use crate::opendal_remote::OpendalRemote;
use crate::operator::build_operator;
use crate::remote::{RemoteRead, RemoteReadWrite, RemoteWatch};
use crate::watcher::PollingWatcher;

/// Resolved once when a worker starts and held for its lifetime.
#[derive(Clone)]
pub struct RemoteBackend {
    pub kind: RemoteKind,
    pub read: Arc<dyn RemoteRead>,
    pub write: Arc<dyn RemoteReadWrite>,
    pub watch: Arc<dyn RemoteWatch>,
}

impl RemoteBackend {
    /// Bundle one object implementing both read and read-write with a
    /// polling watcher over it.
    pub fn new<R>(kind: RemoteKind, remote: Arc<R>, settings: &SyncSettings) -> Self
    where
        R: RemoteRead + RemoteReadWrite + 'static,
    {
        let read: Arc<dyn RemoteRead> = remote.clone();
        let watch = Arc::new(PollingWatcher::new(
            read.clone(),
            settings.remote_poll_interval(),
            settings.remote_backoff_max(),
        ));
        Self {
            kind,
            read,
            write: remote,
            watch,
        }
    }

    pub fn from_config(cfg: &RemoteConfig, settings: &SyncSettings) -> Result<Self> {
        let backend = match cfg.kind {
            RemoteKind::Memory => Self::new(cfg.kind, Arc::new(MemoryRemote::new()), settings),
            RemoteKind::Sftp | RemoteKind::S3 => Self::new(
                cfg.kind,
                Arc::new(OpendalRemote::new(build_operator(cfg)?)),
                settings,
            ),
        };
        info!(kind = %cfg.kind, "remote backend ready");
        Ok(backend)
    }
}
