//! cfsync-remote: the remote side of a sync root.
//!
//! Three capabilities (read, read-write, watch) resolved once per root from
//! its [`RemoteKind`](cfsync_core::RemoteKind) and bundled in a
//! [`RemoteBackend`].

pub mod backend;
pub mod health;
pub mod memory;
pub mod opendal_remote;
pub mod operator;
pub mod remote;
pub mod watcher;

pub use backend::RemoteBackend;
pub use health::{check_health, is_healthy};
pub use memory::MemoryRemote;
pub use opendal_remote::OpendalRemote;
pub use operator::build_operator;
pub use remote::{RemoteEvent, RemoteRead, RemoteReadWrite, RemoteWatch, WatchScope};
pub use watcher::PollingWatcher;
