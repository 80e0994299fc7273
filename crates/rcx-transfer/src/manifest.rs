//! Manifest-backed location service over an OpenDAL operator
//!
//! Layout under `{prefix}`:
//!
//! ```text
//! manifests/{resource_hash}.json   ChunkManifest
//! chunks/{resource_hash}/{index}   sealed chunk frames
//! uploads/{upload_id}/upload.json  UploadDescriptor
//! uploads/{upload_id}/{index}      plaintext upload chunks
//! ```

use opendal::{ErrorKind, Operator};
use rcx_core::types::TransferSource;
use rcx_crypto::{Algorithm, SealedChain};
use serde::{Deserialize, Serialize};

use crate::collab::{ChunkLocations, LocationError, LocationService, UploadRequest, UploadTicket};
use futures::future::BoxFuture;

pub const MANIFEST_VERSION: u32 = 1;

/// Describes one stored resource and where its chunks live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub version: u32,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub chunk_count: usize,
    /// Base64 key for the last chunk; absent until the resource is sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_key: Option<String>,
    /// Chunk object paths, index order.
    pub chunks: Vec<String>,
}

impl ChunkManifest {
    pub fn from_bytes(data: &[u8]) -> Result<Self, LocationError> {
        let manifest: Self = serde_json::from_slice(data)
            .map_err(|e| LocationError::Failed(format!("parsing manifest: {e}")))?;
        if manifest.chunks.len() != manifest.chunk_count {
            return Err(LocationError::Failed(format!(
                "manifest lists {} chunks but declares {}",
                manifest.chunks.len(),
                manifest.chunk_count
            )));
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LocationError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| LocationError::Failed(format!("serializing manifest: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UploadDescriptor {
    file_name: String,
    file_size: u64,
    content_type: String,
    chunk_size: u64,
    total_chunks: usize,
}

fn io_failure(context: impl std::fmt::Display, err: opendal::Error) -> LocationError {
    if err.kind() == ErrorKind::NotFound {
        LocationError::NotFound(context.to_string())
    } else {
        LocationError::Failed(format!("{context}: {err}"))
    }
}

#[derive(Clone, Debug)]
pub struct ManifestLocations {
    op: Operator,
    prefix: String,
}

impl ManifestLocations {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { op, prefix }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub fn manifest_path(&self, resource_hash: &str) -> String {
        format!("{}/manifests/{resource_hash}.json", self.prefix)
    }

    pub fn chunk_path(&self, resource_hash: &str, index: usize) -> String {
        format!("{}/chunks/{resource_hash}/{index:08}", self.prefix)
    }

    fn upload_dir(&self, upload_id: &str) -> String {
        format!("{}/uploads/{upload_id}/", self.prefix)
    }

    fn upload_locations(&self, upload_id: &str, total: usize) -> Vec<String> {
        let dir = self.upload_dir(upload_id);
        (0..total).map(|i| format!("{dir}{i:08}")).collect()
    }

    pub async fn read_manifest(&self, resource_hash: &str) -> Result<ChunkManifest, LocationError> {
        let path = self.manifest_path(resource_hash);
        let buf = self
            .op
            .read(&path)
            .await
            .map_err(|e| io_failure(&path, e))?;
        ChunkManifest::from_bytes(&buf.to_vec())
    }

    pub async fn write_manifest(
        &self,
        resource_hash: &str,
        manifest: &ChunkManifest,
    ) -> Result<(), LocationError> {
        let path = self.manifest_path(resource_hash);
        self.op
            .write(&path, manifest.to_bytes()?)
            .await
            .map_err(|e| io_failure(&path, e))?;
        Ok(())
    }

    /// Seal `plaintext` into a key ring of `chunk_size` slices and store
    /// frames plus manifest. Returns the resource hash and the base64
    /// initial key.
    pub async fn publish_sealed(
        &self,
        file_name: &str,
        content_type: &str,
        plaintext: &[u8],
        chunk_size: usize,
        algorithm: Algorithm,
    ) -> Result<(String, String), LocationError> {
        let resource_hash = rcx_crypto::content_hash(plaintext);
        let slices: Vec<&[u8]> = if plaintext.is_empty() {
            vec![plaintext]
        } else {
            plaintext.chunks(chunk_size.max(1)).collect()
        };
        let SealedChain {
            frames,
            initial_key,
        } = rcx_crypto::encrypt_chain(&slices, algorithm)
            .map_err(|e| LocationError::Failed(format!("sealing {file_name}: {e}")))?;

        let mut chunks = Vec::with_capacity(frames.len());
        for (index, frame) in frames.into_iter().enumerate() {
            let path = self.chunk_path(&resource_hash, index);
            self.op
                .write(&path, frame)
                .await
                .map_err(|e| io_failure(&path, e))?;
            chunks.push(path);
        }
        let initial_key = initial_key.to_base64();
        let manifest = ChunkManifest {
            version: MANIFEST_VERSION,
            file_name: file_name.to_string(),
            file_size: plaintext.len() as u64,
            content_type: content_type.to_string(),
            chunk_count: chunks.len(),
            initial_key: Some(initial_key.clone()),
            chunks,
        };
        self.write_manifest(&resource_hash, &manifest).await?;
        tracing::info!(
            resource = %resource_hash,
            chunks = manifest.chunk_count,
            bytes = manifest.file_size,
            %algorithm,
            "resource sealed"
        );
        Ok((resource_hash, initial_key))
    }
}

impl LocationService for ManifestLocations {
    fn locate<'a>(
        &'a self,
        source: &'a TransferSource,
        resource_hash: &'a str,
    ) -> BoxFuture<'a, Result<ChunkLocations, LocationError>> {
        Box::pin(async move {
            if source.is_shared() {
                return Err(LocationError::Unsupported(format!(
                    "shared resource {resource_hash} has no chunk manifest"
                )));
            }
            let manifest = self.read_manifest(resource_hash).await?;
            Ok(ChunkLocations {
                locations: manifest.chunks,
                initial_key: manifest.initial_key,
                file_name: manifest.file_name,
                file_size: Some(manifest.file_size),
                content_type: manifest.content_type,
            })
        })
    }

    fn begin_upload<'a>(
        &'a self,
        request: &'a UploadRequest,
    ) -> BoxFuture<'a, Result<UploadTicket, LocationError>> {
        Box::pin(async move {
            let upload_id = match &request.upload_id {
                Some(id) => id.clone(),
                None => uuid::Uuid::new_v4().to_string(),
            };
            let descriptor = UploadDescriptor {
                file_name: request.file_name.clone(),
                file_size: request.file_size,
                content_type: request.content_type.clone(),
                chunk_size: request.chunk_size,
                total_chunks: request.total_chunks,
            };
            let path = format!("{}upload.json", self.upload_dir(&upload_id));
            let body = serde_json::to_vec_pretty(&descriptor)
                .map_err(|e| LocationError::Failed(format!("serializing {path}: {e}")))?;
            self.op
                .write(&path, body)
                .await
                .map_err(|e| io_failure(&path, e))?;
            tracing::debug!(upload_id, chunks = request.total_chunks, "upload registered");
            Ok(UploadTicket {
                locations: self.upload_locations(&upload_id, request.total_chunks),
                upload_id,
            })
        })
    }

    fn complete_upload<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), LocationError>> {
        Box::pin(async move {
            let path = format!("{}upload.json", self.upload_dir(upload_id));
            let buf = self
                .op
                .read(&path)
                .await
                .map_err(|e| io_failure(&path, e))?;
            let descriptor: UploadDescriptor = serde_json::from_slice(&buf.to_vec())
                .map_err(|e| LocationError::Failed(format!("parsing {path}: {e}")))?;

            let chunks = self.upload_locations(upload_id, descriptor.total_chunks);
            for chunk in &chunks {
                if !self.op.exists(chunk).await.map_err(|e| io_failure(chunk, e))? {
                    return Err(LocationError::Failed(format!(
                        "upload {upload_id} is missing {chunk}"
                    )));
                }
            }
            let manifest = ChunkManifest {
                version: MANIFEST_VERSION,
                file_name: descriptor.file_name,
                file_size: descriptor.file_size,
                content_type: descriptor.content_type,
                chunk_count: chunks.len(),
                initial_key: None,
                chunks,
            };
            self.write_manifest(upload_id, &manifest).await?;
            tracing::info!(upload_id, "upload completed");
            Ok(())
        })
    }

    fn cancel_upload<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), LocationError>> {
        Box::pin(async move {
            let dir = self.upload_dir(upload_id);
            let entries = match self.op.list(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(io_failure(&dir, e)),
            };
            for entry in entries {
                if entry.metadata().is_file() {
                    self.op
                        .delete(entry.path())
                        .await
                        .map_err(|e| io_failure(entry.path(), e))?;
                }
            }
            tracing::debug!(upload_id, "upload discarded");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcx_crypto::{decrypt_chain, ChunkKey};

    fn memory() -> ManifestLocations {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        ManifestLocations::new(op, "rcx")
    }

    #[tokio::test]
    async fn test_publish_then_locate() {
        let svc = memory();
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let (hash, key) = svc
            .publish_sealed("data.bin", "application/octet-stream", &data, 1000, Algorithm::Aes256Gcm)
            .await
            .unwrap();
        let located = svc.locate(&TransferSource::Owned, &hash).await.unwrap();
        assert_eq!(located.chunk_count(), 3);
        assert_eq!(located.file_size, Some(2500));
        assert_eq!(located.initial_key.as_deref(), Some(key.as_str()));
        assert_eq!(located.locations[2], format!("rcx/chunks/{hash}/00000002"));

        let mut frames = Vec::new();
        for loc in &located.locations {
            frames.push(svc.operator().read(loc).await.unwrap().to_vec());
        }
        let key = ChunkKey::from_base64(&key).unwrap();
        assert_eq!(decrypt_chain(&frames, &key).unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let err = memory()
            .locate(&TransferSource::Owned, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, LocationError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_shared_sources_unsupported() {
        let source = TransferSource::PublicShare {
            share_code: "abc".into(),
        };
        let err = memory().locate(&source, "h").await.unwrap_err();
        assert!(matches!(err, LocationError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_upload_lifecycle() {
        let svc = memory();
        let request = UploadRequest {
            file_name: "notes.txt".into(),
            file_size: 5,
            content_type: "text/plain".into(),
            chunk_size: 3,
            total_chunks: 2,
            upload_id: None,
        };
        let ticket = svc.begin_upload(&request).await.unwrap();
        assert_eq!(ticket.locations.len(), 2);

        // Resuming hands back the same locations.
        let again = svc
            .begin_upload(&UploadRequest {
                upload_id: Some(ticket.upload_id.clone()),
                ..request.clone()
            })
            .await
            .unwrap();
        assert_eq!(again, ticket);

        svc.operator().write(&ticket.locations[0], b"abc".to_vec()).await.unwrap();
        let err = svc.complete_upload(&ticket.upload_id).await.unwrap_err();
        assert!(matches!(err, LocationError::Failed(_)));

        svc.operator().write(&ticket.locations[1], b"de".to_vec()).await.unwrap();
        svc.complete_upload(&ticket.upload_id).await.unwrap();
        let manifest = svc.read_manifest(&ticket.upload_id).await.unwrap();
        assert_eq!(manifest.chunk_count, 2);
        assert_eq!(manifest.initial_key, None);
    }

    #[tokio::test]
    async fn test_cancel_upload_removes_chunks() {
        let svc = memory();
        let ticket = svc
            .begin_upload(&UploadRequest {
                file_name: "x".into(),
                file_size: 1,
                content_type: "text/plain".into(),
                chunk_size: 1,
                total_chunks: 1,
                upload_id: None,
            })
            .await
            .unwrap();
        svc.operator().write(&ticket.locations[0], b"x".to_vec()).await.unwrap();
        svc.cancel_upload(&ticket.upload_id).await.unwrap();
        assert!(!svc.operator().exists(&ticket.locations[0]).await.unwrap());
        // Unknown uploads are fine too.
        svc.cancel_upload("never-started").await.unwrap();
    }

    #[test]
    fn test_manifest_count_mismatch_rejected() {
        let json = br#"{"version":1,"file_name":"a","file_size":1,"content_type":"x","chunk_count":2,"chunks":["c0"]}"#;
        assert!(ChunkManifest::from_bytes(json).is_err());
    }
}
