//! Collaborator seams: the service that issues chunk locations and keys, and
//! the proxy that can deliver a whole file on the engine's behalf.

use bytes::Bytes;
use futures::future::BoxFuture;
use rcx_core::types::TransferSource;
use rcx_core::TransferError;
use rcx_storage::TransportError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Everything needed to fetch one resource chunk by chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLocations {
    /// One location per chunk, index order.
    pub locations: Vec<String>,
    /// Base64 key that decrypts the last chunk. `None` if the resource has
    /// not been sealed yet.
    pub initial_key: Option<String>,
    pub file_name: String,
    pub file_size: Option<u64>,
    pub content_type: String,
}

impl ChunkLocations {
    pub fn chunk_count(&self) -> usize {
        self.locations.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    /// Set when resuming; the service should hand back the same upload.
    pub upload_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub upload_id: String,
    pub locations: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LocationError {
    /// The service cannot issue chunk locations for this source.
    #[error("chunked transfer unsupported: {0}")]
    Unsupported(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("location service: {0}")]
    Failed(String),
}

impl From<LocationError> for TransferError {
    fn from(err: LocationError) -> Self {
        match err {
            LocationError::NotFound(what) => TransferError::ResourceNotFound(what),
            other => TransferError::Location(other.to_string()),
        }
    }
}

pub trait LocationService: Send + Sync {
    fn locate<'a>(
        &'a self,
        source: &'a TransferSource,
        resource_hash: &'a str,
    ) -> BoxFuture<'a, Result<ChunkLocations, LocationError>>;

    /// Fresh locations once the previous set's validity window has passed.
    fn renew<'a>(
        &'a self,
        source: &'a TransferSource,
        resource_hash: &'a str,
    ) -> BoxFuture<'a, Result<ChunkLocations, LocationError>> {
        self.locate(source, resource_hash)
    }

    fn begin_upload<'a>(
        &'a self,
        request: &'a UploadRequest,
    ) -> BoxFuture<'a, Result<UploadTicket, LocationError>>;

    fn complete_upload<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), LocationError>>;

    fn cancel_upload<'a>(&'a self, _upload_id: &'a str) -> BoxFuture<'a, Result<(), LocationError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Delivers a complete plaintext file without chunk-level involvement.
pub trait ProxyDownloader: Send + Sync {
    fn download<'a>(
        &'a self,
        source: &'a TransferSource,
        resource_hash: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>>;
}
