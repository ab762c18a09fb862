//! Per-path asynchronous mutual exclusion with explicit FIFO hand-off.
//!
//! Each tracked path has one slot and a queue of waiters. Release passes the
//! slot directly to the oldest live waiter, so grant order is submission
//! order no matter how the runtime schedules wakeups. An entry exists only
//! while the slot is held; it is removed under the same mutex that checks
//! the queue is empty.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use cfsync_core::paths::normalize_relative;
use tokio::sync::oneshot;
use tracing::{debug, error};

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockEntry {
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct Inner {
    /// Present key = slot held.
    entries: Mutex<HashMap<String, LockEntry>>,
    next_waiter: AtomicU64,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand the slot to the next live waiter, or drop the entry.
    fn release(&self, key: &str) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            error!(path = %key, "release of a path lock that is not held");
            return;
        };
        while let Some(waiter) = entry.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        entries.remove(key);
    }
}

/// Injected, explicitly owned lock table for one sync root.
#[derive(Clone, Default)]
pub struct FileLocker {
    inner: Arc<Inner>,
}

/// Holds a path's slot. Dropping it wakes the oldest waiter.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FileLockGuard {
    inner: Arc<Inner>,
    key: String,
}

impl FileLockGuard {
    pub fn path(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for FileLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockGuard").field("path", &self.key).finish()
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

/// A queued acquisition. If dropped before completing, it leaves the queue,
/// or passes the slot on when it had already been granted.
struct PendingAcquire {
    inner: Arc<Inner>,
    key: String,
    id: u64,
    grant: oneshot::Receiver<()>,
    done: bool,
}

impl Future for PendingAcquire {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.grant).poll(cx) {
            Poll::Ready(Ok(())) => {
                self.done = true;
                Poll::Ready(())
            }
            // The sender lives in the queue until it is used, and only the
            // releasing side removes it.
            Poll::Ready(Err(_)) => {
                self.done = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let granted = {
            let mut entries = self.inner.entries();
            let queued = entries.get_mut(&self.key).and_then(|entry| {
                entry
                    .waiters
                    .iter()
                    .position(|w| w.id == self.id)
                    .map(|idx| entry.waiters.remove(idx))
            });
            queued.is_none() && self.grant.try_recv().is_ok()
        };
        if granted {
            self.inner.release(&self.key);
        }
    }
}

impl FileLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the slot for `relative`, waiting behind earlier callers.
    pub async fn lock(&self, relative: &str) -> FileLockGuard {
        let key = normalize_relative(relative);
        let pending = {
            let mut entries = self.inner.entries();
            match entries.get_mut(&key) {
                None => {
                    entries.insert(key.clone(), LockEntry::default());
                    None
                }
                Some(entry) => {
                    let (tx, rx) = oneshot::channel();
                    let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
                    entry.waiters.push_back(Waiter { id, grant: tx });
                    debug!(path = %key, queued = entry.waiters.len(), "waiting for path lock");
                    Some(PendingAcquire {
                        inner: self.inner.clone(),
                        key: key.clone(),
                        id,
                        grant: rx,
                        done: false,
                    })
                }
            }
        };
        if let Some(pending) = pending {
            pending.await;
        }
        FileLockGuard {
            inner: self.inner.clone(),
            key,
        }
    }

    /// Lock several paths at once. Keys are de-duplicated and taken in
    /// lexicographic order, so two callers locking the same pair in opposite
    /// roles cannot deadlock.
    pub async fn lock_many(&self, relatives: &[&str]) -> Vec<FileLockGuard> {
        let mut keys: Vec<String> = relatives.iter().map(|r| normalize_relative(r)).collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(&key).await);
        }
        guards
    }

    pub fn is_locked(&self, relative: &str) -> bool {
        self.inner
            .entries()
            .contains_key(&normalize_relative(relative))
    }

    /// Waiters queued behind the current holder of `relative`.
    pub fn queued(&self, relative: &str) -> usize {
        self.inner
            .entries()
            .get(&normalize_relative(relative))
            .map_or(0, |e| e.waiters.len())
    }

    /// Paths with a live entry. Zero once every guard is dropped.
    pub fn tracked_paths(&self) -> usize {
        self.inner.entries().len()
    }
}
