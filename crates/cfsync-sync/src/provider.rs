//! One sync root's worker: connect, populate, watch, shut down.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use cfsync_cloudfilter::CloudFilter;
use cfsync_core::{PopulationPolicy, ShellCommand, SyncProviderContext, SyncSettings};
use cfsync_remote::RemoteBackend;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client_watcher::ClientWatcher;
use crate::connector::SyncRootConnector;
use crate::locker::FileLocker;
use crate::metrics::SyncMetrics;
use crate::placeholders::PlaceholdersService;
use crate::remote_watcher::RemoteWatcher;
use crate::shell::{shell_channel, ShellCommandQueue, ShellCommandSender};
use crate::task_queue::TaskQueue;
use crate::upload::RemoteUploader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Starting,
    Populating,
    Running,
    Stopping,
    Stopped,
    Failed,
}

pub struct SyncProvider {
    context: Arc<SyncProviderContext>,
    remote: RemoteBackend,
    locker: FileLocker,
    metrics: SyncMetrics,
    placeholders: Arc<PlaceholdersService>,
    uploader: Arc<RemoteUploader>,
    connector: Arc<SyncRootConnector>,
    cancel: CancellationToken,
    status: watch::Sender<ProviderStatus>,
    shell_tx: ShellCommandSender,
    shell_rx: Mutex<Option<mpsc::UnboundedReceiver<ShellCommand>>>,
}

/// Everything started by `run` that has to be stopped again.
struct Running {
    queue: Arc<TaskQueue>,
    watch_cancel: CancellationToken,
    watchers: Vec<tokio::task::JoinHandle<()>>,
}

impl SyncProvider {
    pub fn new(
        context: SyncProviderContext,
        filter: Arc<dyn CloudFilter>,
        remote: RemoteBackend,
        settings: SyncSettings,
        metrics: SyncMetrics,
    ) -> Self {
        let context = Arc::new(context);
        let locker = FileLocker::new();
        let placeholders = Arc::new(PlaceholdersService::new(
            context.clone(),
            filter.clone(),
            remote.read.clone(),
            settings.clone(),
            metrics.clone(),
        ));
        let uploader = Arc::new(RemoteUploader::new(
            filter.clone(),
            remote.read.clone(),
            remote.write.clone(),
            placeholders.clone(),
            metrics.clone(),
        ));
        let connector = Arc::new(SyncRootConnector::new(
            context.clone(),
            filter,
            remote.clone(),
            placeholders.clone(),
            locker.clone(),
            settings,
            metrics.clone(),
        ));
        let (shell_tx, shell_rx) = shell_channel();
        let (status, _) = watch::channel(ProviderStatus::Starting);
        Self {
            context,
            remote,
            locker,
            metrics,
            placeholders,
            uploader,
            connector,
            cancel: CancellationToken::new(),
            status,
            shell_tx,
            shell_rx: Mutex::new(Some(shell_rx)),
        }
    }

    pub fn context(&self) -> &SyncProviderContext {
        &self.context
    }

    pub fn placeholders(&self) -> &Arc<PlaceholdersService> {
        &self.placeholders
    }

    pub fn locker(&self) -> &FileLocker {
        &self.locker
    }

    pub fn connector(&self) -> &Arc<SyncRootConnector> {
        &self.connector
    }

    /// Context-menu commands for this root. Accepted until the worker stops.
    pub fn shell_commands(&self) -> ShellCommandSender {
        self.shell_tx.clone()
    }

    pub fn status(&self) -> ProviderStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProviderStatus> {
        self.status.subscribe()
    }

    /// Wait until startup finished, successfully or not.
    pub async fn wait_started(&self) -> ProviderStatus {
        let mut rx = self.status.subscribe();
        let result = rx
            .wait_for(|s| !matches!(s, ProviderStatus::Starting | ProviderStatus::Populating))
            .await;
        match result {
            Ok(status) => *status,
            Err(_) => ProviderStatus::Stopped,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_status(&self, status: ProviderStatus) {
        self.status.send_replace(status);
    }

    /// The worker's whole life. Returns once cancelled and shut down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let result = self.serve().await;
        match &result {
            Ok(()) => self.set_status(ProviderStatus::Stopped),
            Err(e) => {
                warn!(root = %self.context.id, "sync root worker failed: {e:#}");
                self.set_status(ProviderStatus::Failed);
            }
        }
        result
    }

    async fn serve(&self) -> Result<()> {
        self.set_status(ProviderStatus::Starting);
        let shell_rx = self
            .shell_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .context("sync root worker already ran")?;

        self.connector.connect().await?;
        let result = self.serve_connected(shell_rx).await;
        // Queues are drained by now, so no callback work is left dangling
        if let Err(e) = self.connector.disconnect().await {
            warn!(root = %self.context.id, "disconnect failed: {e}");
        }
        result
    }

    async fn serve_connected(
        &self,
        shell_rx: mpsc::UnboundedReceiver<ShellCommand>,
    ) -> Result<()> {
        if self.context.population_policy == PopulationPolicy::Full {
            self.set_status(ProviderStatus::Populating);
            let created = self
                .placeholders
                .create_bulk("")
                .await
                .with_context(|| format!("populating {}", self.context.root.display()))?;
            info!(root = %self.context.id, created, "sync root populated");
        }

        let running = self.start_watchers().await?;
        let shell = ShellCommandQueue::start(
            self.context.clone(),
            self.remote.read.clone(),
            self.placeholders.clone(),
            self.uploader.clone(),
            self.locker.clone(),
            running.queue.clone(),
            self.metrics.clone(),
            shell_rx,
            CancellationToken::new(),
        );
        self.set_status(ProviderStatus::Running);
        info!(root = %self.context.id, path = %self.context.root.display(), "sync root running");

        self.cancel.cancelled().await;
        self.set_status(ProviderStatus::Stopping);
        info!(root = %self.context.id, "sync root stopping");

        shell.stop().await;
        running.stop().await;
        Ok(())
    }

    async fn start_watchers(&self) -> Result<Running> {
        let queue = Arc::new(TaskQueue::start(
            self.context.id.to_string(),
            CancellationToken::new(),
        ));
        let mut running = Running {
            queue: queue.clone(),
            watch_cancel: self.cancel.child_token(),
            watchers: Vec::new(),
        };

        let client = Arc::new(ClientWatcher::new(
            self.context.clone(),
            self.placeholders.clone(),
            self.uploader.clone(),
            self.locker.clone(),
            queue.clone(),
            self.metrics.clone(),
        ));
        let remote = Arc::new(RemoteWatcher::new(
            self.context.clone(),
            self.remote.clone(),
            self.placeholders.clone(),
            self.locker.clone(),
            queue,
            self.metrics.clone(),
        ));

        let started = match client.start(running.watch_cancel.clone()) {
            Ok(handle) => {
                running.watchers.push(handle);
                remote.start(running.watch_cancel.clone()).await
            }
            Err(e) => Err(e),
        };
        match started {
            Ok(handle) => {
                running.watchers.push(handle);
                Ok(running)
            }
            Err(e) => {
                running.stop().await;
                Err(e.context("starting watchers"))
            }
        }
    }
}

impl Running {
    /// Watchers first so nothing is enqueued after the queue drains.
    async fn stop(self) {
        self.watch_cancel.cancel();
        for handle in self.watchers {
            let _ = handle.await;
        }
        self.queue.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfsync_cloudfilter::LocalCloudFilter;
    use cfsync_core::{RemoteKind, SyncRootId};
    use cfsync_remote::MemoryRemote;

    fn context(root: std::path::PathBuf) -> SyncProviderContext {
        SyncProviderContext {
            id: SyncRootId::new("dave"),
            display_name: "Dave".into(),
            root,
            population_policy: PopulationPolicy::Full,
            remote_kind: RemoteKind::Memory,
        }
    }

    #[tokio::test]
    async fn unregistered_root_fails_to_start() {
        let tmp = tempfile::TempDir::new().unwrap();
        let filter = LocalCloudFilter::open(&tmp.path().join("store.json")).unwrap();
        let settings = SyncSettings::default();
        let backend =
            RemoteBackend::new(RemoteKind::Memory, Arc::new(MemoryRemote::new()), &settings);
        let provider = Arc::new(SyncProvider::new(
            context(tmp.path().join("root")),
            Arc::new(filter),
            backend,
            settings,
            SyncMetrics::default(),
        ));

        let err = provider.clone().run().await.unwrap_err();
        assert!(format!("{err:#}").contains("connecting sync root"), "{err:#}");
        assert_eq!(provider.status(), ProviderStatus::Failed);
        assert!(!provider.connector().is_connected());
    }

    #[tokio::test]
    async fn worker_runs_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let filter = LocalCloudFilter::open(&tmp.path().join("store.json")).unwrap();
        let settings = SyncSettings::default();
        let backend =
            RemoteBackend::new(RemoteKind::Memory, Arc::new(MemoryRemote::new()), &settings);
        let provider = Arc::new(SyncProvider::new(
            context(tmp.path().join("root")),
            Arc::new(filter),
            backend,
            settings,
            SyncMetrics::default(),
        ));
        provider.shell_rx.lock().unwrap().take();
        let err = provider.clone().run().await.unwrap_err();
        assert!(err.to_string().contains("already ran"));
    }
}
