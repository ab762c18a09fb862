//! What the OS layer persists about a registered sync root.
//!
//! The context blob is a fixed-layout record so that it survives being stored
//! opaquely by the platform and read back by a later process:
//!
//! ```text
//! 0..4     magic "CFSC"
//! 4        version (1)
//! 5        remote kind
//! 6..8     port, big-endian
//! 8..136   host, NUL padded
//! 136..200 user, NUL padded
//! 200..456 remote root, NUL padded
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::path::PathBuf;

use crate::config::SyncRootConfig;
use crate::error::{CfsyncError, CfsyncResult};
use crate::types::{PopulationPolicy, RemoteKind};

const PROVIDER_PREFIX: &str = "cfsync!";
const BLOB_MAGIC: &[u8; 4] = b"CFSC";
const BLOB_VERSION: u8 = 1;
const HOST_LEN: usize = 128;
const USER_LEN: usize = 64;
const ROOT_LEN: usize = 256;

/// Opaque sync-root id. Encodes the account it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncRootId(String);

impl SyncRootId {
    pub fn new(account: &str) -> Self {
        Self(format!("{PROVIDER_PREFIX}{account}"))
    }

    pub fn parse(raw: &str) -> CfsyncResult<Self> {
        match raw.strip_prefix(PROVIDER_PREFIX) {
            Some(account) if !account.is_empty() => Ok(Self(raw.to_string())),
            _ => Err(CfsyncError::Config(format!("not a cfsync root id: {raw:?}"))),
        }
    }

    pub fn account(&self) -> &str {
        &self.0[PROVIDER_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncRootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend connection parameters, serialized into the registration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContextBlob {
    pub kind: RemoteKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub root: String,
}

impl RemoteContextBlob {
    pub const LEN: usize = 4 + 1 + 1 + 2 + HOST_LEN + USER_LEN + ROOT_LEN;

    pub fn encode(&self) -> CfsyncResult<Bytes> {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(BLOB_MAGIC);
        buf.put_u8(BLOB_VERSION);
        buf.put_u8(self.kind.to_byte());
        buf.put_u16(self.port);
        put_padded(&mut buf, "host", &self.host, HOST_LEN)?;
        put_padded(&mut buf, "user", &self.user, USER_LEN)?;
        put_padded(&mut buf, "root", &self.root, ROOT_LEN)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut data: &[u8]) -> CfsyncResult<Self> {
        if data.len() != Self::LEN {
            return Err(CfsyncError::Config(format!(
                "context blob is {} bytes, expected {}",
                data.len(),
                Self::LEN
            )));
        }
        if &data[..4] != BLOB_MAGIC {
            return Err(CfsyncError::Config("context blob: bad magic".into()));
        }
        data.advance(4);
        let version = data.get_u8();
        if version != BLOB_VERSION {
            return Err(CfsyncError::Config(format!(
                "context blob: unsupported version {version}"
            )));
        }
        let kind_byte = data.get_u8();
        let kind = RemoteKind::from_byte(kind_byte).ok_or_else(|| {
            CfsyncError::Config(format!("context blob: unknown remote kind {kind_byte}"))
        })?;
        let port = data.get_u16();
        let host = take_padded(&mut data, HOST_LEN)?;
        let user = take_padded(&mut data, USER_LEN)?;
        let root = take_padded(&mut data, ROOT_LEN)?;
        Ok(Self {
            kind,
            host,
            port,
            user,
            root,
        })
    }
}

fn put_padded(buf: &mut BytesMut, field: &str, value: &str, width: usize) -> CfsyncResult<()> {
    let raw = value.as_bytes();
    if raw.len() > width || raw.contains(&0) {
        return Err(CfsyncError::Config(format!(
            "context blob: {field} does not fit in {width} bytes"
        )));
    }
    buf.put_slice(raw);
    buf.put_bytes(0, width - raw.len());
    Ok(())
}

fn take_padded(data: &mut &[u8], width: usize) -> CfsyncResult<String> {
    let field = &data[..width];
    let end = field.iter().position(|b| *b == 0).unwrap_or(width);
    let value = std::str::from_utf8(&field[..end])
        .map_err(|e| CfsyncError::Config(format!("context blob: {e}")))?
        .to_string();
    data.advance(width);
    Ok(value)
}

/// Everything the OS layer is told when a root is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRootRegistration {
    pub id: SyncRootId,
    pub display_name: String,
    pub local_path: PathBuf,
    pub population_policy: PopulationPolicy,
    pub context: Bytes,
}

impl SyncRootRegistration {
    pub fn from_config(cfg: &SyncRootConfig) -> CfsyncResult<Self> {
        let blob = RemoteContextBlob {
            kind: cfg.remote.kind,
            host: match cfg.remote.kind {
                RemoteKind::S3 => cfg.remote.endpoint.clone(),
                _ => cfg.remote.host.clone(),
            },
            port: cfg.remote.port,
            user: cfg.remote.user.clone(),
            root: match cfg.remote.kind {
                RemoteKind::S3 => format!("{}/{}", cfg.remote.bucket, cfg.remote.root),
                _ => cfg.remote.root.clone(),
            },
        };
        let display_name = if cfg.display_name.is_empty() {
            cfg.account.clone()
        } else {
            cfg.display_name.clone()
        };
        Ok(Self {
            id: SyncRootId::new(&cfg.account),
            display_name,
            local_path: cfg.local_path.clone(),
            population_policy: cfg.population_policy,
            context: blob.encode()?,
        })
    }

    pub fn remote_context(&self) -> CfsyncResult<RemoteContextBlob> {
        RemoteContextBlob::decode(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> RemoteContextBlob {
        RemoteContextBlob {
            kind: RemoteKind::Sftp,
            host: "192.168.1.20".into(),
            port: 2222,
            user: "alice".into(),
            root: "/storage/emulated/0".into(),
        }
    }

    #[test]
    fn root_id_encodes_account() {
        let id = SyncRootId::new("alice@phone");
        assert_eq!(id.as_str(), "cfsync!alice@phone");
        assert_eq!(id.account(), "alice@phone");
        assert_eq!(SyncRootId::parse(id.as_str()).unwrap(), id);
        assert!(SyncRootId::parse("other!x").is_err());
        assert!(SyncRootId::parse("cfsync!").is_err());
    }

    #[test]
    fn blob_has_fixed_layout() {
        let encoded = blob().encode().unwrap();
        assert_eq!(encoded.len(), RemoteContextBlob::LEN);
        assert_eq!(&encoded[..4], b"CFSC");
        assert_eq!(encoded[4], 1);
        assert_eq!(&encoded[6..8], &2222u16.to_be_bytes());
        assert_eq!(&encoded[8..20], b"192.168.1.20");
        assert_eq!(encoded[20], 0);
        assert_eq!(RemoteContextBlob::decode(&encoded).unwrap(), blob());
    }

    #[test]
    fn blob_rejects_oversized_fields() {
        let mut b = blob();
        b.user = "u".repeat(USER_LEN + 1);
        assert!(b.encode().is_err());
    }

    #[test]
    fn blob_rejects_corruption() {
        let mut encoded = blob().encode().unwrap().to_vec();
        assert!(RemoteContextBlob::decode(&encoded[..10]).is_err());
        encoded[5] = 99;
        assert!(RemoteContextBlob::decode(&encoded).is_err());
        encoded[0] = b'X';
        assert!(RemoteContextBlob::decode(&encoded).is_err());
    }

    #[test]
    fn registration_from_config() {
        let cfg = SyncRootConfig {
            account: "alice".into(),
            local_path: PathBuf::from("/home/alice/Phone"),
            ..Default::default()
        };
        let reg = SyncRootRegistration::from_config(&cfg).unwrap();
        assert_eq!(reg.display_name, "alice");
        assert_eq!(reg.id.account(), "alice");
        assert_eq!(reg.remote_context().unwrap().port, 22);
    }
}
