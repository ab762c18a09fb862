//! cfsync-cloudfilter: the placeholder (virtual filesystem) layer
//!
//! The sync engine talks to the platform through two traits:
//! - [`CloudFilter`]: sync root registration, placeholder create/update,
//!   hydrate/dehydrate, pin and in-sync state, and answers to pending
//!   platform requests (transfer data, acks)
//! - [`SyncCallbacks`]: requests the platform raises for a connected root
//!   (fetch placeholders, fetch data, rename/delete notifications)
//!
//! ## Architecture
//!
//! ```text
//! shell / applications
//!       │
//!       ├── LocalCloudFilter (emulated platform)
//!       │         │
//!       │         ├── open on a dehydrated file   → fetch_data
//!       │         ├── list an unpopulated dir     → fetch_placeholders
//!       │         └── rename / delete             → notify_*, wait for ack
//!       │
//!       └── cfsync-sync SyncRootConnector (implements SyncCallbacks)
//!                 │
//!                 └── remote reads, transfer_data / ack_* back into the filter
//! ```
//!
//! [`LocalCloudFilter`] keeps the platform's view of every placeholder in a
//! JSON [`PlaceholderStore`], so it runs anywhere a plain directory does.

pub mod error;
pub mod filter;
pub mod local;
pub mod store;

pub use error::{CfResult, CloudFilterError};
pub use filter::{
    CancelFetchDataRequest, CloudFilter, ConnectionKey, FetchDataRequest,
    FetchPlaceholdersRequest, HandleMode, Hydration, NotifyDeleteRequest, NotifyRenameRequest,
    PlaceholderDescriptor, PlaceholderHandle, PlaceholderInfo, PlaceholderMetadata,
    SyncCallbacks, TransferKey, UpdateFlags,
};
pub use local::{ExternalLock, LocalCloudFilter};
pub use store::{PlaceholderRecord, PlaceholderStore};
