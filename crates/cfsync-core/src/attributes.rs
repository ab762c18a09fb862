//! File attribute bits and the sync-state vocabulary layered over them.
//!
//! Values match the native Windows `FILE_ATTRIBUTE_*` constants so a real
//! Cloud Files backend can pass them through unchanged. The sync-state bits
//! (pin intent, offline, recall-pending) are a disjoint range: they describe
//! how a placeholder relates to its remote copy, never what the file *is*,
//! and must be masked out before any identity comparison.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const NORMAL = 0x0000_0080;
        const TEMPORARY = 0x0000_0100;
        const SPARSE_FILE = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
        const NOT_CONTENT_INDEXED = 0x0000_2000;

        // Sync-state vocabulary
        const OFFLINE = 0x0000_1000;
        const RECALL_ON_OPEN = 0x0004_0000;
        const PINNED = 0x0008_0000;
        const UNPINNED = 0x0010_0000;
        const RECALL_ON_DATA_ACCESS = 0x0040_0000;
    }
}

impl FileAttributes {
    /// Every bit that encodes sync state rather than file identity.
    pub const SYNC_MASK: FileAttributes = FileAttributes::OFFLINE
        .union(FileAttributes::RECALL_ON_OPEN)
        .union(FileAttributes::PINNED)
        .union(FileAttributes::UNPINNED)
        .union(FileAttributes::RECALL_ON_DATA_ACCESS);

    /// Bits a placeholder implementation manages on its own (sparse storage,
    /// reparse tag). Never part of a remote snapshot.
    pub const STORAGE_MASK: FileAttributes =
        FileAttributes::SPARSE_FILE.union(FileAttributes::REPARSE_POINT);

    /// Attributes with all sync-state and storage bits removed.
    pub fn identity_bits(self) -> FileAttributes {
        self.difference(Self::SYNC_MASK.union(Self::STORAGE_MASK))
    }

    pub fn sync_bits(self) -> FileAttributes {
        self.intersection(Self::SYNC_MASK)
    }

    pub fn is_directory(self) -> bool {
        self.contains(FileAttributes::DIRECTORY)
    }

    /// Not fully present locally. For a directory this means some descendant
    /// is not present, never that the directory itself holds byte content.
    pub fn is_offline(self) -> bool {
        self.contains(FileAttributes::OFFLINE)
    }

    pub fn recall_pending(self) -> bool {
        self.intersects(FileAttributes::RECALL_ON_OPEN | FileAttributes::RECALL_ON_DATA_ACCESS)
    }

    pub fn pin_state(self) -> PinState {
        if self.contains(FileAttributes::PINNED) {
            PinState::Pinned
        } else if self.contains(FileAttributes::UNPINNED) {
            PinState::Unpinned
        } else {
            PinState::Unspecified
        }
    }

    /// Replace the pin intent bits, leaving everything else intact.
    pub fn with_pin_state(self, pin: PinState) -> FileAttributes {
        let cleared = self.difference(FileAttributes::PINNED | FileAttributes::UNPINNED);
        match pin {
            PinState::Unspecified => cleared,
            PinState::Pinned => cleared | FileAttributes::PINNED,
            PinState::Unpinned => cleared | FileAttributes::UNPINNED,
        }
    }

    /// Default attributes for a remote entry of the given kind.
    pub fn for_entry(is_directory: bool) -> FileAttributes {
        if is_directory {
            FileAttributes::DIRECTORY
        } else {
            FileAttributes::ARCHIVE
        }
    }
}

/// User intent for keeping a placeholder's content local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    #[default]
    Unspecified,
    /// Always keep on this device.
    Pinned,
    /// Free up space whenever possible.
    Unpinned,
}
