use std::path::PathBuf;
use thiserror::Error;

pub type CfsyncResult<T> = Result<T, CfsyncError>;

#[derive(Debug, Error)]
pub enum CfsyncError {
    #[error("remote error: {0}")]
    Remote(String),

    #[error("native call {op} failed: {code}")]
    Native { op: &'static str, code: String },

    #[error("file is in use by another process: {} (gave up after {attempts} attempts)", path.display())]
    FileLocked { path: PathBuf, attempts: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
