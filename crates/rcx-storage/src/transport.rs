//! Chunk transport: fetch or submit one chunk at an opaque location
//!
//! Locations are whatever the location service hands out. For the OpenDAL
//! transport they are operator paths; another transport could treat them as
//! presigned URLs. Retries are not done here: the caller owns the retry
//! policy and uses [`TransportError::is_retryable`] to drive it.

use bytes::Bytes;
use futures::future::BoxFuture;
use opendal::{ErrorKind, Operator};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Transient: connection trouble, throttling, server-side failure.
    #[error("transient transport error: {0}")]
    Retryable(String),

    /// Permanent for these inputs: missing object, denied, bad request.
    #[error("transport error: {0}")]
    Fatal(String),

    #[error("transport operation cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<opendal::Error> for TransportError {
    fn from(err: opendal::Error) -> Self {
        let fatal = matches!(
            err.kind(),
            ErrorKind::NotFound
                | ErrorKind::PermissionDenied
                | ErrorKind::ConfigInvalid
                | ErrorKind::Unsupported
                | ErrorKind::IsADirectory
                | ErrorKind::NotADirectory
                | ErrorKind::ConditionNotMatch
        );
        if fatal && !err.is_temporary() {
            Self::Fatal(err.to_string())
        } else {
            Self::Retryable(err.to_string())
        }
    }
}

/// Network primitive used by the fetcher and the upload pool.
///
/// Implementations must return promptly with [`TransportError::Cancelled`]
/// once `cancel` fires.
pub trait ChunkTransport: Send + Sync {
    fn fetch<'a>(
        &'a self,
        location: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>>;

    fn submit<'a>(
        &'a self,
        location: &'a str,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// [`ChunkTransport`] over an OpenDAL operator; locations are paths.
#[derive(Clone, Debug)]
pub struct OperatorTransport {
    op: Operator,
}

impl OperatorTransport {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

impl ChunkTransport for OperatorTransport {
    fn fetch<'a>(
        &'a self,
        location: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                res = self.op.read(location) => {
                    let buf = res.map_err(TransportError::from)?;
                    tracing::trace!(location, bytes = buf.len(), "chunk fetched");
                    Ok(buf.to_bytes())
                }
            }
        })
    }

    fn submit<'a>(
        &'a self,
        location: &'a str,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let len = data.len();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                res = self.op.write(location, data) => {
                    res.map_err(TransportError::from)?;
                    tracing::trace!(location, bytes = len, "chunk submitted");
                    Ok(())
                }
            }
        })
    }
}
