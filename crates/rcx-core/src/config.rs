use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RcxError, RcxResult};

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Top-level configuration (loaded from rcx.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RcxConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub state: StateConfig,
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or EnvFilter directive (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Fs,
    Memory,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageKind,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    /// Refuse plain-HTTP S3 endpoints
    pub enforce_tls: bool,
    /// Key prefix for manifests, chunks, and uploads
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent chunk operations per transfer (clamped to 1..=10)
    pub concurrency: usize,
    /// Retries per chunk after the first attempt
    pub max_retries: u32,
    /// Base retry delay; attempt `n` waits `retry_delay_ms * 2^n`
    pub retry_delay_ms: u64,
    /// Plaintext slice size for uploads
    pub chunk_size: u64,
    /// Lifetime of issued chunk locations
    pub location_ttl_secs: u64,
    /// Refresh locations this long before they expire
    pub location_expiry_buffer_secs: u64,
    /// Compare embedded content hashes after decryption
    pub verify_hash: bool,
    /// Out-of-order plaintext chunks a streaming writer may hold
    pub max_pending_chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Fs,
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateKind,
    /// Directory (fs) or database path (rocksdb)
    pub path: PathBuf,
    /// Byte quota for persisted chunks (fs and memory backends)
    pub max_bytes: Option<u64>,
    /// Tasks older than this are swept on restore
    pub expiry_days: u32,
}

/// File size thresholds used when choosing a destination strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub large_file_warning: u64,
    pub streaming_recommended: u64,
    pub max_safe_inmemory: u64,
    pub max_downloadable: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Fs,
            root: PathBuf::from("~/.local/share/rcx/objects"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "rcx".into(),
            enforce_tls: false,
            prefix: "rcx".into(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            retry_delay_ms: 1000,
            chunk_size: 5 * MIB,
            location_ttl_secs: 24 * 3600,
            location_expiry_buffer_secs: 3600,
            verify_hash: true,
            max_pending_chunks: 64,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateKind::Fs,
            path: PathBuf::from("~/.local/share/rcx/state"),
            max_bytes: None,
            expiry_days: 7,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            large_file_warning: 500 * MIB,
            streaming_recommended: GIB,
            max_safe_inmemory: 2 * GIB,
            max_downloadable: 100 * GIB,
        }
    }
}

impl TransferConfig {
    pub fn clamped_concurrency(&self) -> usize {
        clamp_concurrency(self.concurrency)
    }
}

pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

impl RcxConfig {
    pub fn from_toml(text: &str) -> RcxResult<Self> {
        toml::from_str(text).map_err(|e| RcxError::Config(e.to_string()))
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> RcxResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RcxError::Io(e)),
        }
    }

    pub fn to_toml(&self) -> RcxResult<String> {
        toml::to_string(self).map_err(|e| RcxError::Config(e.to_string()))
    }
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
