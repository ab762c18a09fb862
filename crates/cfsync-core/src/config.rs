use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CfsyncError, CfsyncResult};
use crate::types::{PopulationPolicy, RemoteKind};

/// Top-level daemon configuration (loaded from cfsync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CfsyncConfig {
    pub daemon: DaemonConfig,
    pub sync: SyncSettings,
    pub roots: Vec<SyncRootConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the emulated placeholder attribute stores
    pub state_dir: PathBuf,
    /// Prometheus metrics + health endpoint (default: 127.0.0.1:9101)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Bounds shared by every component of a sync root. Passed explicitly, never
/// read from a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Attempts before giving up on a file held open by another process
    pub lock_retry_attempts: u32,
    pub lock_retry_delay_ms: u64,
    /// Polls for an entry to vanish after a delete completion
    pub delete_poll_attempts: u32,
    pub delete_poll_delay_ms: u64,
    /// FetchData working buffer size in bytes
    pub transfer_chunk_size: usize,
    pub remote_poll_interval_ms: u64,
    pub remote_backoff_max_ms: u64,
    /// Glob patterns to exclude from sync
    pub exclude_patterns: Vec<String>,
}

impl SyncSettings {
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn delete_poll_delay(&self) -> Duration {
        Duration::from_millis(self.delete_poll_delay_ms)
    }

    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_millis(self.remote_poll_interval_ms)
    }

    pub fn remote_backoff_max(&self) -> Duration {
        Duration::from_millis(self.remote_backoff_max_ms)
    }
}

/// One `[[roots]]` entry: a local directory paired with a remote tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRootConfig {
    /// Account identifier, encoded into the sync root id
    pub account: String,
    pub display_name: String,
    pub local_path: PathBuf,
    pub population_policy: PopulationPolicy,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub kind: RemoteKind,
    /// SFTP host
    pub host: String,
    pub port: u16,
    pub user: String,
    /// SFTP private key
    pub key_path: Option<PathBuf>,
    /// Remote root directory (SFTP) or key prefix (S3)
    pub root: String,
    /// S3 endpoint
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Environment variables holding S3 credentials
    pub access_key_env: String,
    pub secret_key_env: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("~/.local/share/cfsync"),
            metrics_addr: Some("127.0.0.1:9101".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lock_retry_attempts: 60,
            lock_retry_delay_ms: 500,
            delete_poll_attempts: 10,
            delete_poll_delay_ms: 500,
            transfer_chunk_size: 1024 * 1024,
            remote_poll_interval_ms: 5000,
            remote_backoff_max_ms: 60_000,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: RemoteKind::Sftp,
            host: "localhost".into(),
            port: 22,
            user: String::new(),
            key_path: None,
            root: "/".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "cfsync".into(),
            access_key_env: "AWS_ACCESS_KEY_ID".into(),
            secret_key_env: "AWS_SECRET_ACCESS_KEY".into(),
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

impl CfsyncConfig {
    pub fn from_toml(text: &str) -> CfsyncResult<Self> {
        let config: CfsyncConfig =
            toml::from_str(text).map_err(|e| CfsyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject roots that cannot be registered: empty account, relative or
    /// duplicate local path, or nested sync roots.
    pub fn validate(&self) -> CfsyncResult<()> {
        for (i, root) in self.roots.iter().enumerate() {
            if root.account.trim().is_empty() {
                return Err(CfsyncError::Config(format!("roots[{i}]: account is empty")));
            }
            let local = expand_tilde(&root.local_path);
            if !local.is_absolute() {
                return Err(CfsyncError::Config(format!(
                    "roots[{i}]: local_path must be absolute: {}",
                    root.local_path.display()
                )));
            }
            for other in &self.roots[..i] {
                let other_local = expand_tilde(&other.local_path);
                if other.account == root.account {
                    return Err(CfsyncError::Config(format!(
                        "roots[{i}]: duplicate account {:?}",
                        root.account
                    )));
                }
                if local.starts_with(&other_local) || other_local.starts_with(&local) {
                    return Err(CfsyncError::Config(format!(
                        "roots[{i}]: {} overlaps {}",
                        local.display(),
                        other_local.display()
                    )));
                }
            }
        }
        Ok(())
    }
}
