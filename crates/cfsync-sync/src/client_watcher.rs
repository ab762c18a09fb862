//! Local filesystem watcher for one sync root.
//!
//! Turns notify events into queued work: user pin/unpin requests become
//! hydrate/dehydrate, new local entries are created on the remote, and local
//! edits are pushed under the path's lock. Renames and deletes arrive through
//! the placeholder layer's callbacks instead.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use cfsync_core::{PinState, SyncProviderContext};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::locker::FileLocker;
use crate::metrics::SyncMetrics;
use crate::placeholders::PlaceholdersService;
use crate::task_queue::TaskQueue;
use crate::upload::RemoteUploader;

const SOURCE: &str = "client_watcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Change {
    Created,
    Changed,
}

pub struct ClientWatcher {
    context: Arc<SyncProviderContext>,
    placeholders: Arc<PlaceholdersService>,
    uploader: Arc<RemoteUploader>,
    locker: FileLocker,
    queue: Arc<TaskQueue>,
    metrics: SyncMetrics,
    /// Work already queued and not yet started, to coalesce event bursts.
    pending: Mutex<HashSet<(Change, String)>>,
}

impl ClientWatcher {
    pub fn new(
        context: Arc<SyncProviderContext>,
        placeholders: Arc<PlaceholdersService>,
        uploader: Arc<RemoteUploader>,
        locker: FileLocker,
        queue: Arc<TaskQueue>,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            context,
            placeholders,
            uploader,
            locker,
            queue,
            metrics,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Start watching the root recursively. The watcher lives until `cancel`.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&self.context.root, RecursiveMode::Recursive)?;
        info!(root = %self.context.root.display(), "watching local changes");
        Ok(tokio::spawn(self.run(watcher, rx, cancel)))
    }

    async fn run(
        self: Arc<Self>,
        _watcher: RecommendedWatcher,
        mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(Ok(event)) => self.dispatch(event),
                    Some(Err(e)) => warn!("file watcher error: {e}"),
                    None => break,
                },
            }
        }
        debug!(root = %self.context.id, "client watcher stopped");
    }

    fn dispatch(self: &Arc<Self>, event: Event) {
        let change = match event.kind {
            EventKind::Create(_) => Change::Created,
            // Renames are reported by the placeholder layer
            EventKind::Modify(ModifyKind::Name(_)) => return,
            EventKind::Modify(_) => Change::Changed,
            _ => return,
        };
        for path in &event.paths {
            let Some(rel) = self.relevant(path) else {
                continue;
            };
            let key = (change, rel.clone());
            if !self.pending_set().insert(key.clone()) {
                continue;
            }
            let this = self.clone();
            let label = format!("local {change:?} {rel}");
            self.queue.enqueue(label, async move {
                this.pending_set().remove(&key);
                let result = match change {
                    Change::Created => this.handle_created(&rel).await,
                    Change::Changed => this.handle_changed(&rel).await,
                };
                if let Err(e) = result {
                    warn!(path = %rel, "local {change:?} handling failed: {e:#}");
                    this.metrics.handler_failed(SOURCE);
                }
            });
        }
    }

    fn pending_set(&self) -> std::sync::MutexGuard<'_, HashSet<(Change, String)>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn relevant(&self, path: &Path) -> Option<String> {
        let rel = self.context.relative_path(path)?;
        if rel.is_empty() || self.placeholders.is_excluded(&rel) {
            return None;
        }
        Some(rel)
    }

    async fn handle_created(&self, relative: &str) -> Result<()> {
        let _guard = self.locker.lock(relative).await;
        let Some(info) = self.placeholders.local_info(relative)? else {
            return Ok(());
        };
        if info.is_placeholder && info.in_sync {
            // Projected from the remote, nothing to push
            return Ok(());
        }
        self.uploader.push_update(relative).await
    }

    async fn handle_changed(&self, relative: &str) -> Result<()> {
        let Some(info) = self.placeholders.local_info(relative)? else {
            return Ok(());
        };
        let pin = info.pin_state();
        if info.is_directory {
            if pin == PinState::Pinned && info.is_offline() {
                info!(path = %relative, "directory pinned, bringing it local");
                self.placeholders.create_bulk(relative).await?;
                let hydrated = self.placeholders.hydrate_tree(relative).await?;
                info!(path = %relative, hydrated, "pinned directory hydrated");
            }
        } else if pin == PinState::Unpinned
            && info.is_placeholder
            && info.in_sync
            && !info.is_offline()
        {
            let _guard = self.locker.lock(relative).await;
            self.placeholders.dehydrate(relative).await?;
        }

        let _guard = self.locker.lock(relative).await;
        self.uploader.push_update(relative).await
    }
}
