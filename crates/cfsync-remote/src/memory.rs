//! In-memory remote for dry runs and tests.
//!
//! Unlike a real server it keeps the write times the caller supplies, so a
//! file uploaded from a local edit carries the local write time and
//! last-writer-wins comparisons are exact.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cfsync_core::fingerprint::truncate_to_filetime;
use cfsync_core::paths::{self, normalize_relative};
use cfsync_core::{
    CfsyncError, FileAttributes, LocalEntryInfo, RemoteDirectoryInfo, RemoteEntry,
    RemoteFileInfo, RemoteFileSystemInfo,
};

use crate::remote::{name_matches, RemoteRead, RemoteReadWrite};

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Bytes,
        modified: SystemTime,
        attributes: FileAttributes,
    },
    Dir {
        modified: SystemTime,
    },
}

/// One recorded `read_range` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    pub relative: String,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Default)]
pub struct MemoryRemote {
    nodes: Mutex<BTreeMap<String, Node>>,
    reads: Mutex<Vec<RangeRead>>,
    unreachable: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file, creating missing parents with the same time.
    pub fn put_file(&self, relative: &str, data: impl Into<Bytes>, modified: SystemTime) {
        let rel = normalize_relative(relative);
        let mut nodes = self.lock();
        Self::ensure_parents(&mut nodes, &rel, modified);
        nodes.insert(
            rel,
            Node::File {
                data: data.into(),
                modified: truncate_to_filetime(modified),
                attributes: FileAttributes::ARCHIVE,
            },
        );
    }

    pub fn put_dir(&self, relative: &str, modified: SystemTime) {
        let rel = normalize_relative(relative);
        if rel.is_empty() {
            return;
        }
        let mut nodes = self.lock();
        Self::ensure_parents(&mut nodes, &rel, modified);
        nodes.insert(
            rel,
            Node::Dir {
                modified: truncate_to_filetime(modified),
            },
        );
    }

    /// Remove an entry and its subtree. Returns false if absent.
    pub fn remove(&self, relative: &str) -> bool {
        let rel = normalize_relative(relative);
        let mut nodes = self.lock();
        let existed = nodes.contains_key(&rel);
        nodes.retain(|k, _| !paths::is_within(&rel, k));
        existed
    }

    pub fn file_data(&self, relative: &str) -> Option<Bytes> {
        match self.lock().get(&normalize_relative(relative)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn modified(&self, relative: &str) -> Option<SystemTime> {
        match self.lock().get(&normalize_relative(relative))? {
            Node::File { modified, .. } | Node::Dir { modified } => Some(*modified),
        }
    }

    /// Every relative path currently stored, in sorted order.
    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Simulate a dropped connection: every call fails until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn range_reads(&self) -> Vec<RangeRead> {
        self.reads.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CfsyncError::Remote("memory remote is unreachable".into()).into());
        }
        Ok(())
    }

    fn ensure_parents(nodes: &mut BTreeMap<String, Node>, rel: &str, modified: SystemTime) {
        let mut parent = paths::parent_of(rel);
        while !parent.is_empty() {
            nodes
                .entry(parent.to_string())
                .or_insert(Node::Dir {
                    modified: truncate_to_filetime(modified),
                });
            parent = paths::parent_of(parent);
        }
    }

    fn entry_for(rel: &str, node: &Node) -> RemoteEntry {
        match node {
            Node::File {
                data,
                modified,
                attributes,
            } => RemoteEntry::File(RemoteFileInfo {
                info: RemoteFileSystemInfo::new(rel, *attributes, *modified),
                length: data.len() as u64,
            }),
            Node::Dir { modified } => RemoteEntry::Directory(RemoteDirectoryInfo {
                info: RemoteFileSystemInfo::new(rel, FileAttributes::DIRECTORY, *modified),
            }),
        }
    }

    /// Move `old` and its subtree to `new`.
    fn move_tree(&self, old: &str, new: &str) -> Result<()> {
        let old = normalize_relative(old);
        let new = normalize_relative(new);
        let mut nodes = self.lock();
        if !nodes.contains_key(&old) {
            return Err(CfsyncError::NotFound(old).into());
        }
        let moved: Vec<(String, Node)> = nodes
            .iter()
            .filter(|(k, _)| paths::is_within(&old, k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let modified = match moved.first() {
            Some((_, Node::File { modified, .. } | Node::Dir { modified })) => *modified,
            None => SystemTime::now(),
        };
        Self::ensure_parents(&mut nodes, &new, modified);
        for (key, node) in moved {
            nodes.remove(&key);
            let suffix = &key[old.len()..];
            nodes.insert(format!("{new}{suffix}"), node);
        }
        Ok(())
    }

    async fn store_file(&self, local: &LocalEntryInfo) -> Result<()> {
        self.check_reachable()?;
        let data = tokio::fs::read(&local.path)
            .await
            .with_context(|| format!("reading upload source: {}", local.path.display()))?;
        let attributes = local
            .attributes
            .identity_bits()
            .difference(FileAttributes::DIRECTORY);
        let rel = normalize_relative(&local.relative_path);
        let mut nodes = self.lock();
        Self::ensure_parents(&mut nodes, &rel, local.modified);
        nodes.insert(
            rel,
            Node::File {
                data: Bytes::from(data),
                modified: truncate_to_filetime(local.modified),
                attributes: if attributes.is_empty() {
                    FileAttributes::ARCHIVE
                } else {
                    attributes
                },
            },
        );
        Ok(())
    }
}

#[async_trait]
impl RemoteRead for MemoryRemote {
    async fn try_enumerate(&self, dir: &str, pattern: &str) -> Result<Vec<RemoteEntry>> {
        self.check_reachable()?;
        let dir = normalize_relative(dir);
        let nodes = self.lock();
        if !dir.is_empty() && !matches!(nodes.get(&dir), Some(Node::Dir { .. })) {
            return Err(CfsyncError::NotFound(dir).into());
        }
        Ok(nodes
            .iter()
            .filter(|(k, _)| !k.is_empty() && paths::parent_of(k) == dir)
            .filter(|(k, _)| name_matches(pattern, paths::file_name(k)))
            .map(|(k, v)| Self::entry_for(k, v))
            .collect())
    }

    async fn stat(&self, relative: &str) -> Result<Option<RemoteEntry>> {
        self.check_reachable()?;
        let rel = normalize_relative(relative);
        if rel.is_empty() {
            return Ok(Some(RemoteEntry::Directory(RemoteDirectoryInfo {
                info: RemoteFileSystemInfo::new("", FileAttributes::DIRECTORY, SystemTime::UNIX_EPOCH),
            })));
        }
        Ok(self.lock().get(&rel).map(|node| Self::entry_for(&rel, node)))
    }

    async fn read_range(&self, relative: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.check_reachable()?;
        let rel = normalize_relative(relative);
        if let Ok(mut reads) = self.reads.lock() {
            reads.push(RangeRead {
                relative: rel.clone(),
                offset,
                len,
            });
        }
        match self.lock().get(&rel) {
            Some(Node::File { data, .. }) => {
                let size = data.len() as u64;
                let start = offset.min(size) as usize;
                let end = offset.saturating_add(len).min(size) as usize;
                Ok(data.slice(start..end))
            }
            Some(Node::Dir { .. }) => anyhow::bail!("cannot read a directory: {rel}"),
            None => Err(CfsyncError::NotFound(rel).into()),
        }
    }
}

#[async_trait]
impl RemoteReadWrite for MemoryRemote {
    async fn create_file(&self, local: &LocalEntryInfo) -> Result<()> {
        self.store_file(local).await
    }

    async fn create_directory(&self, local: &LocalEntryInfo) -> Result<()> {
        self.check_reachable()?;
        self.put_dir(&local.relative_path, local.modified);
        Ok(())
    }

    async fn update_file(&self, local: &LocalEntryInfo) -> Result<()> {
        self.store_file(local).await
    }

    async fn move_file(&self, old: &str, new: &str) -> Result<()> {
        self.check_reachable()?;
        self.move_tree(old, new)
    }

    async fn move_directory(&self, old: &str, new: &str) -> Result<()> {
        self.check_reachable()?;
        self.move_tree(old, new)
    }

    async fn delete_file(&self, relative: &str) -> Result<()> {
        self.check_reachable()?;
        self.remove(relative);
        Ok(())
    }

    async fn delete_directory(&self, relative: &str) -> Result<()> {
        self.check_reachable()?;
        self.remove(relative);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn sample() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.put_file("a.txt", vec![1u8; 100], t(10));
        remote.put_file("dir/b.txt", vec![2u8; 50], t(10));
        remote
    }

    #[tokio::test]
    async fn enumerate_lists_direct_children() {
        let remote = sample();
        let mut root: Vec<String> = remote
            .enumerate("", "*")
            .await
            .iter()
            .map(|e| e.relative_path().to_string())
            .collect();
        root.sort();
        assert_eq!(root, vec!["a.txt", "dir"]);

        let sub = remote.enumerate("dir", "*").await;
        assert_eq!(sub.len(), 1);
        assert_eq!(sub[0].length(), 50);
        assert_eq!(sub[0].info().relative_parent, "dir");

        assert!(remote.enumerate("", "*.bin").await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_enumerate_degrades_to_empty() {
        let remote = sample();
        remote.set_unreachable(true);
        assert!(remote.try_enumerate("", "*").await.is_err());
        assert!(remote.enumerate("", "*").await.is_empty());
    }

    #[tokio::test]
    async fn stat_and_kind() {
        let remote = sample();
        assert!(remote.is_directory("dir").await.unwrap());
        assert!(!remote.is_directory("a.txt").await.unwrap());
        assert!(!remote.exists("missing").await.unwrap());
        assert_eq!(remote.get_file_info("a.txt").await.unwrap().length, 100);
        assert!(remote.get_file_info("dir").await.is_err());
        assert!(remote.get_directory_info("dir").await.is_ok());
    }

    #[tokio::test]
    async fn read_range_clamps_at_eof() {
        let remote = sample();
        let data = remote.read_range("a.txt", 90, 64).await.unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(remote.range_reads().len(), 1);
    }

    #[tokio::test]
    async fn upload_keeps_caller_write_time() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("new.txt");
        std::fs::write(&path, b"hello").unwrap();
        let remote = sample();
        let local = LocalEntryInfo {
            path: path.clone(),
            relative_path: "dir/new.txt".into(),
            is_directory: false,
            length: 5,
            attributes: FileAttributes::ARCHIVE | FileAttributes::PINNED,
            created: t(20),
            modified: t(20),
            accessed: t(20),
        };
        remote.create_file(&local).await.unwrap();
        let info = remote.get_file_info("dir/new.txt").await.unwrap();
        assert_eq!(info.info.modified, t(20));
        assert_eq!(info.info.attributes, FileAttributes::ARCHIVE);
        assert_eq!(remote.file_data("dir/new.txt").unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn move_and_delete_directory_tree() {
        let remote = sample();
        remote.move_directory("dir", "moved/inner").await.unwrap();
        assert!(remote.exists("moved/inner/b.txt").await.unwrap());
        assert!(!remote.exists("dir").await.unwrap());
        assert!(remote.is_directory("moved").await.unwrap());

        remote.delete_directory("moved").await.unwrap();
        assert_eq!(remote.paths(), vec!["a.txt".to_string()]);
        assert!(remote.move_file("nope", "x").await.is_err());
    }
}
