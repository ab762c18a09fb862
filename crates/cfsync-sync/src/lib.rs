//! cfsync-sync: the per-root sync engine.
//!
//! A [`SyncProvider`] owns one sync root. Watchers and shell commands feed a
//! single [`TaskQueue`]; placeholder-layer callbacks run concurrently with it
//! through the [`SyncRootConnector`]. Work on the same path is serialized by
//! the [`FileLocker`].

pub mod client_watcher;
pub mod connector;
pub mod locker;
pub mod metrics;
pub mod placeholders;
pub mod pool;
pub mod provider;
pub mod remote_watcher;
pub mod shell;
pub mod task_queue;
pub mod upload;

pub use client_watcher::ClientWatcher;
pub use connector::SyncRootConnector;
pub use locker::{FileLockGuard, FileLocker};
pub use metrics::SyncMetrics;
pub use placeholders::{PlaceholdersService, UpdateOutcome};
pub use pool::SyncProviderPool;
pub use provider::{ProviderStatus, SyncProvider};
pub use remote_watcher::RemoteWatcher;
pub use shell::{shell_channel, ShellCommandQueue, ShellCommandSender};
pub use task_queue::TaskQueue;
pub use upload::RemoteUploader;
