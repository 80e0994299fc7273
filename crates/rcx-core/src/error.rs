use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RcxResult<T> = Result<T, RcxError>;

/// Errors from configuration loading and other non-transfer plumbing.
#[derive(Debug, Error)]
pub enum RcxError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure taxonomy for a single transfer.
///
/// Everything except `Cancelled` ends a task in the `failed` status; the
/// `kind()` discriminant is what gets persisted alongside the failed task.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid chunk frame{}: {message}", at(.index))]
    InvalidFrame {
        index: Option<usize>,
        message: String,
    },

    #[error("invalid key{}: {message}", at(.index))]
    InvalidKey {
        index: Option<usize>,
        message: String,
    },

    #[error("decryption failed for chunk {index}")]
    DecryptionFailed { index: usize },

    #[error("broken key chain at chunk {index}: {reason}")]
    BrokenKeyChain { index: usize, reason: String },

    #[error("network failure on chunk(s) {indices:?}: {message}")]
    NetworkFailure {
        indices: Vec<usize>,
        message: String,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("local storage full: {0}")]
    StorageFull(String),

    #[error("local storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("location service: {0}")]
    Location(String),

    #[error("output sink: {0}")]
    Sink(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("transfer {id} cannot {operation} while {status}")]
    InvalidState {
        id: String,
        operation: &'static str,
        status: String,
    },

    #[error("unknown transfer: {0}")]
    NotFound(String),

    /// A remote object or local source file that a transfer depends on.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("transfer refused: {0}")]
    Refused(String),

    #[error("config error: {0}")]
    Config(String),
}

fn at(index: &Option<usize>) -> String {
    index.map(|i| format!(" (chunk {i})")).unwrap_or_default()
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFrame { .. } => ErrorKind::InvalidFrame,
            Self::InvalidKey { .. } => ErrorKind::InvalidKey,
            Self::DecryptionFailed { .. } => ErrorKind::DecryptionFailed,
            Self::BrokenKeyChain { .. } => ErrorKind::BrokenKeyChain,
            Self::NetworkFailure { .. } => ErrorKind::NetworkFailure,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::StorageFull(_) => ErrorKind::StorageFull,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::Location(_) => ErrorKind::Location,
            Self::Sink(_) => ErrorKind::Sink,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            Self::Refused(_) => ErrorKind::Refused,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether an explicit user retry can reasonably succeed without new input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure { .. }
                | Self::StorageUnavailable(_)
                | Self::Location(_)
                | Self::Sink(_)
        )
    }
}

/// Copyable discriminant of [`TransferError`], persisted with failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidFrame,
    InvalidKey,
    DecryptionFailed,
    BrokenKeyChain,
    NetworkFailure,
    Cancelled,
    StorageFull,
    StorageUnavailable,
    Location,
    Sink,
    SizeMismatch,
    InvalidState,
    NotFound,
    ResourceNotFound,
    Refused,
    Config,
}

impl ErrorKind {
    /// Failures caused by the chunk bytes or keys themselves.
    pub fn is_crypto(self) -> bool {
        matches!(
            self,
            Self::InvalidFrame | Self::InvalidKey | Self::DecryptionFailed | Self::BrokenKeyChain
        )
    }
}
