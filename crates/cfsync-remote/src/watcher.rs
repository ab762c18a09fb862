//! Polling remote watcher, shared by every backend.
//!
//! Each tick snapshots the part of the remote tree that is materialized
//! locally and diffs it against the previous snapshot. A listing failure
//! never produces events: the previous snapshot is kept and polling backs off
//! exponentially, so a dropped connection does not look like a mass delete.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use cfsync_core::paths;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::remote::{RemoteEvent, RemoteRead, RemoteWatch, WatchScope};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryState {
    is_directory: bool,
    length: u64,
    modified: SystemTime,
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    entries: BTreeMap<String, EntryState>,
    /// Directories whose children were listed in this snapshot.
    scanned: HashSet<String>,
}

pub struct PollingWatcher {
    remote: Arc<dyn RemoteRead>,
    interval: Duration,
    backoff_max: Duration,
}

impl PollingWatcher {
    pub fn new(remote: Arc<dyn RemoteRead>, interval: Duration, backoff_max: Duration) -> Self {
        Self {
            remote,
            interval,
            backoff_max: backoff_max.max(interval),
        }
    }

    async fn snapshot(remote: &dyn RemoteRead, scope: &WatchScope) -> Result<Snapshot> {
        let mut snap = Snapshot::default();
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            let children = remote.try_enumerate(&dir, "*").await?;
            snap.scanned.insert(dir);
            for child in children {
                let rel = child.relative_path().to_string();
                if child.is_directory() && scope(rel.as_str()) {
                    pending.push(rel.clone());
                }
                snap.entries.insert(
                    rel,
                    EntryState {
                        is_directory: child.is_directory(),
                        length: child.length(),
                        modified: child.info().modified,
                    },
                );
            }
        }
        Ok(snap)
    }

    /// Events that turn `old` into `new`. Only entries whose parent was
    /// listed in both snapshots are compared: a directory entering or
    /// leaving scope is not a remote change.
    fn diff(old: &Snapshot, new: &Snapshot) -> Vec<RemoteEvent> {
        let in_both = |rel: &str| {
            let parent = paths::parent_of(rel);
            old.scanned.contains(parent) && new.scanned.contains(parent)
        };

        let mut deleted: Vec<(&String, &EntryState)> = old
            .entries
            .iter()
            .filter(|(k, _)| !new.entries.contains_key(*k) && in_both(k.as_str()))
            .collect();
        let mut created: Vec<(&String, &EntryState)> = new
            .entries
            .iter()
            .filter(|(k, _)| !old.entries.contains_key(*k) && in_both(k.as_str()))
            .collect();

        let mut events = Vec::new();

        // A delete + create pair with identical kind, size and write time is a move.
        deleted.retain(|(old_path, old_state)| {
            match created.iter().position(|(_, s)| *s == *old_state) {
                Some(idx) => {
                    let (new_path, _) = created.remove(idx);
                    events.push(RemoteEvent::Renamed {
                        old: (*old_path).clone(),
                        new: new_path.clone(),
                        is_directory: old_state.is_directory,
                    });
                    false
                }
                None => true,
            }
        });

        // Parents before children
        created.sort_by_key(|(k, _)| k.matches('/').count());
        for (rel, state) in deleted {
            events.push(RemoteEvent::Deleted {
                relative: rel.clone(),
                is_directory: state.is_directory,
            });
        }
        for (rel, state) in created {
            events.push(RemoteEvent::Created {
                relative: rel.clone(),
                is_directory: state.is_directory,
            });
        }
        for (rel, state) in &new.entries {
            if state.is_directory {
                continue;
            }
            if let Some(prev) = old.entries.get(rel) {
                if !prev.is_directory && prev != state && in_both(rel.as_str()) {
                    events.push(RemoteEvent::Changed {
                        relative: rel.clone(),
                        is_directory: false,
                    });
                }
            }
        }
        events
    }

    async fn run(
        remote: Arc<dyn RemoteRead>,
        interval: Duration,
        backoff_max: Duration,
        scope: WatchScope,
        cancel: CancellationToken,
        tx: mpsc::Sender<RemoteEvent>,
    ) {
        let mut previous: Option<Snapshot> = None;
        let mut delay = interval;
        loop {
            match Self::snapshot(remote.as_ref(), &scope).await {
                Ok(current) => {
                    if delay != interval {
                        info!("remote reachable again, resuming normal polling");
                    }
                    delay = interval;
                    if let Some(prev) = &previous {
                        for event in Self::diff(prev, &current) {
                            debug!(?event, "remote change");
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    previous = Some(current);
                }
                Err(e) => {
                    delay = (delay * 2).min(backoff_max);
                    warn!(retry_in = ?delay, "remote poll failed: {e:#}");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("remote watcher stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl RemoteWatch for PollingWatcher {
    async fn start(
        &self,
        scope: WatchScope,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RemoteEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(Self::run(
            self.remote.clone(),
            self.interval,
            self.backoff_max,
            scope,
            cancel,
            tx,
        ));
        Ok(rx)
    }
}
