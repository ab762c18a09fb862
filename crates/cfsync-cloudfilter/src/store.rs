//! Persisted placeholder state for the emulated platform.
//!
//! The native layer keeps sync state in reparse data and attribute bits. The
//! emulation keeps it here instead: one record per placeholder keyed by its
//! absolute path, loaded entirely into memory and flushed atomically via
//! temp+rename.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use cfsync_core::fingerprint::{from_filetime, to_filetime};
use cfsync_core::FileAttributes;
use std::time::SystemTime;

/// Mutations between automatic flushes.
const FLUSH_EVERY: usize = 64;

/// State of a single placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderRecord {
    pub is_directory: bool,
    /// Identity bits plus pin intent; storage and offline bits are derived
    pub attributes: u32,
    /// Last applied metadata was marked in sync
    pub in_sync: bool,
    /// Length the placeholder was last synced at
    pub length: u64,
    /// Write time (FILETIME ticks) the placeholder was last synced at
    pub modified: i64,
    /// Byte ranges present on disk, sorted and merged
    #[serde(default)]
    pub present: Vec<(u64, u64)>,
    /// Directory children have been supplied
    #[serde(default)]
    pub populated: bool,
    /// Directory children must not be requested on enumeration
    #[serde(default)]
    pub on_demand_disabled: bool,
}

impl PlaceholderRecord {
    pub fn attributes(&self) -> FileAttributes {
        FileAttributes::from_bits_retain(self.attributes)
    }

    pub fn set_attributes(&mut self, attrs: FileAttributes) {
        self.attributes = attrs.bits();
    }

    pub fn modified(&self) -> SystemTime {
        from_filetime(self.modified)
    }

    pub fn set_modified(&mut self, t: SystemTime) {
        self.modified = to_filetime(t);
    }

    pub fn is_fully_present(&self) -> bool {
        self.is_directory || self.length == 0 || covers(&self.present, 0, self.length)
    }

    pub fn is_dehydrated(&self) -> bool {
        !self.is_directory && self.length > 0 && self.present.is_empty()
    }

    pub fn mark_present(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        self.present.push((start, end));
        self.present.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.present.len());
        for (s, e) in self.present.drain(..) {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.present = merged;
    }
}

/// True if the merged ranges fully cover `[start, end)`.
pub fn covers(ranges: &[(u64, u64)], start: u64, end: u64) -> bool {
    if end <= start {
        return true;
    }
    ranges.iter().any(|(s, e)| *s <= start && *e >= end)
}

/// In-memory placeholder store, persisted to a JSON file
pub struct PlaceholderStore {
    /// Path to the JSON state file on disk
    db_path: PathBuf,
    entries: BTreeMap<String, PlaceholderRecord>,
    /// Mutations since the last flush
    dirty: usize,
}

impl PlaceholderStore {
    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(db_path: &Path) -> Result<Self> {
        let entries = if db_path.exists() {
            let content = std::fs::read_to_string(db_path)
                .with_context(|| format!("reading placeholder store: {}", db_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing placeholder store: {}", db_path.display()))?
        } else {
            BTreeMap::new()
        };

        Ok(PlaceholderStore {
            db_path: db_path.to_path_buf(),
            entries,
            dirty: 0,
        })
    }

    pub fn get(&self, path: &Path) -> Option<&PlaceholderRecord> {
        self.entries.get(&path_key(path))
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut PlaceholderRecord> {
        self.touch();
        self.entries.get_mut(&path_key(path))
    }

    pub fn set(&mut self, path: &Path, record: PlaceholderRecord) {
        self.entries.insert(path_key(path), record);
        self.touch();
    }

    /// Remove `path` and every record beneath it.
    pub fn remove_tree(&mut self, path: &Path) {
        let prefix = path_key(path);
        let doomed: Vec<String> = self
            .subtree(&prefix)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.entries.remove(&key);
        }
        self.touch();
    }

    /// Re-key `from` and its subtree under `to`.
    pub fn move_tree(&mut self, from: &Path, to: &Path) {
        let from_key = path_key(from);
        let to_key = path_key(to);
        let moved: Vec<(String, PlaceholderRecord)> = self
            .subtree(&from_key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, record) in moved {
            self.entries.remove(&key);
            let suffix = &key[from_key.len()..];
            self.entries.insert(format!("{to_key}{suffix}"), record);
        }
        self.touch();
    }

    /// Records strictly beneath `path`.
    pub fn descendants<'a>(
        &'a self,
        path: &Path,
    ) -> impl Iterator<Item = (&'a String, &'a PlaceholderRecord)> + 'a {
        let key = path_key(path);
        let prefix = format!("{key}/");
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
    }

    fn subtree<'a>(
        &'a self,
        key: &str,
    ) -> impl Iterator<Item = (&'a String, &'a PlaceholderRecord)> + 'a {
        let exact = key.to_string();
        let prefix = format!("{key}/");
        self.entries
            .range(exact.clone()..)
            .take_while({
                let exact = exact.clone();
                move |(k, _)| k.starts_with(&exact)
            })
            .filter(move |(k, _)| **k == exact || k.starts_with(&prefix))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self) {
        self.dirty += 1;
        if self.dirty >= FLUSH_EVERY {
            if let Err(e) = self.flush() {
                tracing::warn!("placeholder store flush failed: {e:#}");
            }
        }
    }

    /// Flush dirty changes to disk using an atomic write (write then rename).
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty == 0 {
            return Ok(());
        }

        // Ensure parent directory exists
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir: {}", parent.display()))?;
        }

        let json =
            serde_json::to_string_pretty(&self.entries).context("serializing placeholder store")?;

        // Atomic write: write to temp file, then rename
        let tmp_path = self.db_path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing placeholder store temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.db_path)
            .with_context(|| format!("renaming placeholder store: {}", self.db_path.display()))?;

        self.dirty = 0;
        Ok(())
    }
}

/// Lexically normalized absolute path string. Entries may not exist on disk,
/// so canonicalize() is not an option.
pub fn path_key(path: &Path) -> String {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    let s = out.to_string_lossy().into_owned();
    if s.len() > 1 {
        s.trim_end_matches('/').to_string()
    } else {
        s
    }
}
