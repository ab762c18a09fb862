use std::path::PathBuf;
use thiserror::Error;

pub type CfResult<T> = Result<T, CloudFilterError>;

/// Status codes surfaced by the virtual-filesystem layer.
#[derive(Debug, Error)]
pub enum CloudFilterError {
    /// Another process holds the file open. Transient: retry later.
    #[error("file is in use: {}", .0.display())]
    InUse(PathBuf),

    /// Dehydration refused because the placeholder is pinned.
    #[error("file is pinned: {}", .0.display())]
    Pinned(PathBuf),

    /// The request was cancelled by the OS or the opener. Not a failure.
    #[error("operation cancelled")]
    Cancelled,

    #[error("not a placeholder: {}", .0.display())]
    NotAPlaceholder(PathBuf),

    #[error("no sync root connected for {}", .0.display())]
    NotConnected(PathBuf),

    #[error("{op} failed: {code}")]
    Status { op: &'static str, code: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudFilterError {
    pub fn status(op: &'static str, code: impl Into<String>) -> Self {
        CloudFilterError::Status {
            op,
            code: code.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CloudFilterError::InUse(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CloudFilterError::Cancelled)
    }
}

impl From<CloudFilterError> for cfsync_core::CfsyncError {
    fn from(e: CloudFilterError) -> Self {
        match e {
            CloudFilterError::Cancelled => cfsync_core::CfsyncError::Cancelled,
            CloudFilterError::Io(io) => cfsync_core::CfsyncError::Io(io),
            CloudFilterError::Status { op, code } => cfsync_core::CfsyncError::Native { op, code },
            other => cfsync_core::CfsyncError::Native {
                op: "cloud filter",
                code: other.to_string(),
            },
        }
    }
}
