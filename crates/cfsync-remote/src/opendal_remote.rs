//! Remote read/read-write over an OpenDAL operator (SFTP, S3, ...).
//!
//! OpenDAL marks directories with a trailing `/`; relative paths from the
//! rest of the engine never carry one, so every call maps between the two.

use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cfsync_core::fingerprint::truncate_to_filetime;
use cfsync_core::paths::{self, normalize_relative};
use cfsync_core::{
    FileAttributes, LocalEntryInfo, RemoteDirectoryInfo, RemoteEntry, RemoteFileInfo,
    RemoteFileSystemInfo,
};
use opendal::{ErrorKind, Metadata, Operator};
use tracing::debug;

use crate::remote::{name_matches, RemoteRead, RemoteReadWrite};

#[derive(Clone)]
pub struct OpendalRemote {
    op: Operator,
}

fn file_key(relative: &str) -> String {
    normalize_relative(relative)
}

fn dir_key(relative: &str) -> String {
    let rel = normalize_relative(relative);
    if rel.is_empty() {
        "/".to_string()
    } else {
        format!("{rel}/")
    }
}

impl OpendalRemote {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn to_entry(relative: &str, meta: &Metadata) -> RemoteEntry {
        let modified = meta
            .last_modified()
            .map(SystemTime::from)
            .map(truncate_to_filetime)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if meta.is_dir() {
            RemoteEntry::Directory(RemoteDirectoryInfo {
                info: RemoteFileSystemInfo::new(relative, FileAttributes::DIRECTORY, modified),
            })
        } else {
            RemoteEntry::File(RemoteFileInfo {
                info: RemoteFileSystemInfo::new(relative, FileAttributes::ARCHIVE, modified),
                length: meta.content_length(),
            })
        }
    }

    async fn upload(&self, local: &LocalEntryInfo) -> Result<()> {
        let data = tokio::fs::read(&local.path)
            .await
            .with_context(|| format!("reading upload source: {}", local.path.display()))?;
        let key = file_key(&local.relative_path);
        self.op
            .write(&key, data)
            .await
            .with_context(|| format!("uploading {key}"))?;
        Ok(())
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        if self.op.info().full_capability().rename {
            self.op
                .rename(from, to)
                .await
                .with_context(|| format!("renaming {from} -> {to}"))?;
        } else {
            self.op
                .copy(from, to)
                .await
                .with_context(|| format!("copying {from} -> {to}"))?;
            self.op
                .delete(from)
                .await
                .with_context(|| format!("deleting {from} after copy"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteRead for OpendalRemote {
    async fn try_enumerate(&self, dir: &str, pattern: &str) -> Result<Vec<RemoteEntry>> {
        let key = dir_key(dir);
        let listed = self
            .op
            .list(&key)
            .await
            .with_context(|| format!("listing {key}"))?;

        let mut entries = Vec::with_capacity(listed.len());
        for entry in listed {
            let relative = normalize_relative(entry.path());
            // OpenDAL includes the listed directory itself
            if relative == normalize_relative(&key) {
                continue;
            }
            if !name_matches(pattern, paths::file_name(&relative)) {
                continue;
            }
            let meta = entry.metadata();
            if meta.last_modified().is_none() {
                // Listings from some services omit mtime; stat to fill it in
                match self.op.stat(entry.path()).await {
                    Ok(full) => {
                        entries.push(Self::to_entry(&relative, &full));
                        continue;
                    }
                    Err(e) => debug!(path = %relative, "stat after list failed: {e}"),
                }
            }
            entries.push(Self::to_entry(&relative, meta));
        }
        Ok(entries)
    }

    async fn stat(&self, relative: &str) -> Result<Option<RemoteEntry>> {
        let rel = normalize_relative(relative);
        if rel.is_empty() {
            return Ok(Some(RemoteEntry::Directory(RemoteDirectoryInfo {
                info: RemoteFileSystemInfo::new(
                    "",
                    FileAttributes::DIRECTORY,
                    SystemTime::UNIX_EPOCH,
                ),
            })));
        }
        match self.op.stat(&file_key(&rel)).await {
            Ok(meta) if !meta.is_dir() => return Ok(Some(Self::to_entry(&rel, &meta))),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("stat {rel}")),
        }
        // Some services answer any `dir/` stat, so confirm directories
        // through the parent listing.
        let parent = paths::parent_of(&rel);
        match self.op.list(&dir_key(parent)).await {
            Ok(listed) => Ok(listed
                .iter()
                .find(|e| e.metadata().is_dir() && normalize_relative(e.path()) == rel)
                .map(|e| Self::to_entry(&rel, e.metadata()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("listing {parent}/")),
        }
    }

    async fn read_range(&self, relative: &str, offset: u64, len: u64) -> Result<Bytes> {
        let key = file_key(relative);
        let buf = self
            .op
            .read_with(&key)
            .range(offset..offset.saturating_add(len))
            .await
            .with_context(|| format!("reading {key} [{offset}, +{len})"))?;
        Ok(buf.to_bytes())
    }
}

#[async_trait]
impl RemoteReadWrite for OpendalRemote {
    async fn create_file(&self, local: &LocalEntryInfo) -> Result<()> {
        self.upload(local).await
    }

    async fn create_directory(&self, local: &LocalEntryInfo) -> Result<()> {
        let key = dir_key(&local.relative_path);
        self.op
            .create_dir(&key)
            .await
            .with_context(|| format!("creating directory {key}"))
    }

    async fn update_file(&self, local: &LocalEntryInfo) -> Result<()> {
        self.upload(local).await
    }

    async fn move_file(&self, old: &str, new: &str) -> Result<()> {
        self.move_entry(&file_key(old), &file_key(new)).await
    }

    async fn move_directory(&self, old: &str, new: &str) -> Result<()> {
        let (old_key, new_key) = (dir_key(old), dir_key(new));
        if self.op.info().full_capability().rename {
            return self
                .op
                .rename(&old_key, &new_key)
                .await
                .with_context(|| format!("renaming {old_key} -> {new_key}"));
        }
        // No native rename: rebuild the tree under the new prefix.
        let entries = self
            .op
            .list_with(&old_key)
            .recursive(true)
            .await
            .with_context(|| format!("listing {old_key}"))?;
        self.op.create_dir(&new_key).await?;
        for entry in &entries {
            let suffix = &entry.path()[old_key.len().min(entry.path().len())..];
            if suffix.is_empty() {
                continue;
            }
            let target = format!("{new_key}{suffix}");
            if entry.metadata().is_dir() {
                self.op.create_dir(&target).await?;
            } else {
                self.op
                    .copy(entry.path(), &target)
                    .await
                    .with_context(|| format!("copying {} -> {target}", entry.path()))?;
            }
        }
        self.delete_directory(old).await
    }

    async fn delete_file(&self, relative: &str) -> Result<()> {
        let key = file_key(relative);
        self.op
            .delete(&key)
            .await
            .with_context(|| format!("deleting {key}"))
    }

    async fn delete_directory(&self, relative: &str) -> Result<()> {
        let key = dir_key(relative);
        let mut entries: Vec<String> = self
            .op
            .list_with(&key)
            .recursive(true)
            .await
            .with_context(|| format!("listing {key}"))?
            .into_iter()
            .map(|e| e.path().to_string())
            .filter(|p| p != &key)
            .collect();
        // Deepest first so directories are empty when removed
        entries.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for path in entries {
            self.op
                .delete(&path)
                .await
                .with_context(|| format!("deleting {path}"))?;
        }
        self.op
            .delete(&key)
            .await
            .with_context(|| format!("deleting {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn memory_remote() -> OpendalRemote {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        OpendalRemote::new(op)
    }

    fn local_file(dir: &std::path::Path, rel: &str, data: &[u8]) -> LocalEntryInfo {
        let path = dir.join(rel.replace('/', "_"));
        std::fs::write(&path, data).unwrap();
        let t = UNIX_EPOCH + Duration::from_secs(100);
        LocalEntryInfo {
            path,
            relative_path: rel.to_string(),
            is_directory: false,
            length: data.len() as u64,
            attributes: FileAttributes::ARCHIVE,
            created: t,
            modified: t,
            accessed: t,
        }
    }

    #[test]
    fn key_mapping() {
        assert_eq!(dir_key(""), "/");
        assert_eq!(dir_key("a/b"), "a/b/");
        assert_eq!(file_key("/a/b.txt"), "a/b.txt");
    }

    #[tokio::test]
    async fn upload_enumerate_and_read_range() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = memory_remote();
        remote
            .create_file(&local_file(tmp.path(), "docs/a.txt", b"0123456789"))
            .await
            .unwrap();

        let root = remote.try_enumerate("", "*").await.unwrap();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_directory());
        assert_eq!(root[0].relative_path(), "docs");

        let docs = remote.try_enumerate("docs", "*").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].length(), 10);

        let data = remote.read_range("docs/a.txt", 2, 3).await.unwrap();
        assert_eq!(data.as_ref(), b"234");
    }

    #[tokio::test]
    async fn stat_distinguishes_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = memory_remote();
        remote
            .create_file(&local_file(tmp.path(), "dir/b.txt", b"b"))
            .await
            .unwrap();
        assert!(remote.is_directory("dir").await.unwrap());
        assert!(!remote.is_directory("dir/b.txt").await.unwrap());
        assert!(!remote.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_directory_removes_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = memory_remote();
        remote
            .create_file(&local_file(tmp.path(), "dir/sub/c.txt", b"c"))
            .await
            .unwrap();
        remote.delete_directory("dir").await.unwrap();
        assert!(!remote.exists("dir/sub/c.txt").await.unwrap());
    }
}
