//! One cancellable worker per registered sync root.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use cfsync_cloudfilter::CloudFilter;
use cfsync_core::{SyncProviderContext, SyncRootId, SyncSettings};
use cfsync_remote::RemoteBackend;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::SyncMetrics;
use crate::provider::SyncProvider;

struct Worker {
    provider: Arc<SyncProvider>,
    handle: JoinHandle<Result<()>>,
}

pub struct SyncProviderPool {
    filter: Arc<dyn CloudFilter>,
    settings: SyncSettings,
    metrics: SyncMetrics,
    workers: Mutex<HashMap<SyncRootId, Worker>>,
}

impl SyncProviderPool {
    pub fn new(filter: Arc<dyn CloudFilter>, settings: SyncSettings, metrics: SyncMetrics) -> Self {
        Self {
            filter,
            settings,
            metrics,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<SyncRootId, Worker>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the worker for `context.id`. A root that is already running is
    /// left alone and its provider returned.
    pub fn start(&self, context: SyncProviderContext, remote: RemoteBackend) -> Arc<SyncProvider> {
        let mut workers = self.workers();
        if let Some(worker) = workers.get(&context.id) {
            if !worker.handle.is_finished() {
                debug!(root = %context.id, "sync root already running");
                return worker.provider.clone();
            }
        }
        let id = context.id.clone();
        let provider = Arc::new(SyncProvider::new(
            context,
            self.filter.clone(),
            remote,
            self.settings.clone(),
            self.metrics.clone(),
        ));
        let handle = tokio::spawn(provider.clone().run());
        info!(root = %id, "sync root worker started");
        workers.insert(
            id,
            Worker {
                provider: provider.clone(),
                handle,
            },
        );
        provider
    }

    /// Cancel a root's worker and wait for it. False if it was not running.
    pub async fn stop(&self, id: &SyncRootId) -> bool {
        let Some(worker) = self.workers().remove(id) else {
            return false;
        };
        worker.provider.cancel();
        Self::join(id, worker.handle).await;
        true
    }

    pub async fn stop_all(&self) {
        let workers: Vec<(SyncRootId, Worker)> = self.workers().drain().collect();
        for (_, worker) in &workers {
            worker.provider.cancel();
        }
        for (id, worker) in workers {
            Self::join(&id, worker.handle).await;
        }
    }

    async fn join(id: &SyncRootId, handle: JoinHandle<Result<()>>) {
        match handle.await {
            Ok(Ok(())) => info!(root = %id, "sync root worker stopped"),
            Ok(Err(e)) => warn!(root = %id, "sync root worker ended with error: {e:#}"),
            Err(e) => error!(root = %id, "sync root worker panicked: {e}"),
        }
    }

    pub fn is_running(&self, id: &SyncRootId) -> bool {
        self.workers()
            .get(id)
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    pub fn provider(&self, id: &SyncRootId) -> Option<Arc<SyncProvider>> {
        self.workers().get(id).map(|worker| worker.provider.clone())
    }

    pub fn ids(&self) -> Vec<SyncRootId> {
        let mut ids: Vec<SyncRootId> = self.workers().keys().cloned().collect();
        ids.sort();
        ids
    }
}
