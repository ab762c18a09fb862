//! Equality fingerprint: decides whether a local placeholder already matches
//! a remote snapshot.
//!
//! The fingerprint covers entry kind, byte length (files only), write time at
//! FILETIME resolution, and the identity attribute bits. Sync-state bits are
//! masked out so that pinning, unpinning or dehydrating a placeholder never
//! makes it look different from its remote copy.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::attributes::FileAttributes;

/// 100ns ticks between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: i64 = 116_444_736_000_000_000;

/// Convert a timestamp to FILETIME ticks (100ns since 1601-01-01).
pub fn to_filetime(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => FILETIME_UNIX_OFFSET + (d.as_nanos() / 100) as i64,
        Err(e) => FILETIME_UNIX_OFFSET - (e.duration().as_nanos() / 100) as i64,
    }
}

/// Inverse of [`to_filetime`].
pub fn from_filetime(ticks: i64) -> SystemTime {
    let rel = ticks - FILETIME_UNIX_OFFSET;
    if rel >= 0 {
        UNIX_EPOCH + Duration::from_nanos(rel as u64 * 100)
    } else {
        UNIX_EPOCH - Duration::from_nanos(rel.unsigned_abs() * 100)
    }
}

/// Truncate a timestamp to FILETIME resolution.
pub fn truncate_to_filetime(t: SystemTime) -> SystemTime {
    from_filetime(to_filetime(t))
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_file(length: u64, modified: SystemTime, attributes: FileAttributes) -> Self {
        Self::compute(false, length, modified, attributes)
    }

    /// Directories carry no content, so length is not part of their identity.
    pub fn of_directory(modified: SystemTime, attributes: FileAttributes) -> Self {
        Self::compute(true, 0, modified, attributes)
    }

    fn compute(is_dir: bool, length: u64, modified: SystemTime, attributes: FileAttributes) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[is_dir as u8]);
        hasher.update(&length.to_le_bytes());
        hasher.update(&to_filetime(modified).to_le_bytes());
        hasher.update(&attributes.identity_bits().bits().to_le_bytes());
        Fingerprint(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}
