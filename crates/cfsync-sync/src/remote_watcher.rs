//! Applies remote changes to the local placeholders of one sync root.

use std::sync::Arc;

use anyhow::Result;
use cfsync_core::{PopulationPolicy, SyncProviderContext};
use cfsync_remote::{RemoteBackend, RemoteEvent, WatchScope};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::locker::FileLocker;
use crate::metrics::SyncMetrics;
use crate::placeholders::PlaceholdersService;
use crate::task_queue::TaskQueue;

const SOURCE: &str = "remote_watcher";

pub struct RemoteWatcher {
    context: Arc<SyncProviderContext>,
    remote: RemoteBackend,
    placeholders: Arc<PlaceholdersService>,
    locker: FileLocker,
    queue: Arc<TaskQueue>,
    metrics: SyncMetrics,
}

impl RemoteWatcher {
    pub fn new(
        context: Arc<SyncProviderContext>,
        remote: RemoteBackend,
        placeholders: Arc<PlaceholdersService>,
        locker: FileLocker,
        queue: Arc<TaskQueue>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            context,
            remote,
            placeholders,
            locker,
            queue,
            metrics,
        }
    }

    /// Start the remote watch, scoped to directories materialized locally.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let scope: WatchScope = {
            let placeholders = self.placeholders.clone();
            Arc::new(move |rel: &str| placeholders.is_materialized(rel))
        };
        let mut events = self.remote.watch.start(scope, cancel.clone()).await?;
        info!(root = %self.context.id, kind = %self.remote.kind, "watching remote changes");
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = events.recv() => match next {
                        Some(event) => self.dispatch(event),
                        None => break,
                    },
                }
            }
            debug!(root = %self.context.id, "remote watcher stopped");
        }))
    }

    fn dispatch(self: &Arc<Self>, event: RemoteEvent) {
        if self.placeholders.is_excluded(event.primary_path()) {
            return;
        }
        let this = self.clone();
        let label = format!("remote {event:?}");
        self.queue.enqueue(label, async move {
            if let Err(e) = this.handle(&event).await {
                warn!(?event, "applying remote change failed: {e:#}");
                this.metrics.handler_failed(SOURCE);
            }
        });
    }

    /// Apply one remote event under the relevant path lock(s).
    pub async fn handle(&self, event: &RemoteEvent) -> Result<()> {
        match event {
            RemoteEvent::Created { relative, .. } => {
                let _guard = self.locker.lock(relative).await;
                if !self.remote.read.exists(relative).await? {
                    debug!(path = %relative, "created entry already gone on remote");
                    return Ok(());
                }
                if self.remote.read.is_directory(relative).await? {
                    self.placeholders.create_or_update_directory(relative).await?;
                    if self.context.population_policy == PopulationPolicy::Full {
                        self.placeholders.create_bulk(relative).await?;
                    }
                } else {
                    self.placeholders.create_or_update_file(relative).await?;
                }
            }
            RemoteEvent::Changed { relative, .. } => {
                let _guard = self.locker.lock(relative).await;
                if self.remote.read.is_directory(relative).await? {
                    if self.placeholders.local_info(relative)?.is_some() {
                        self.placeholders.update_directory(relative).await?;
                    }
                } else {
                    self.placeholders.update_file(relative, false).await?;
                }
            }
            RemoteEvent::Renamed { old, new, .. } => {
                let _guards = self.locker.lock_many(&[old.as_str(), new.as_str()]).await;
                if self.remote.read.is_directory(new).await? {
                    self.placeholders.rename_directory(old, new).await?;
                } else {
                    self.placeholders.rename_file(old, new).await?;
                }
            }
            RemoteEvent::Deleted { relative, .. } => {
                let _guard = self.locker.lock(relative).await;
                if self.placeholders.local_info(relative)?.is_some() {
                    self.placeholders.delete(relative).await?;
                }
            }
        }
        Ok(())
    }
}
