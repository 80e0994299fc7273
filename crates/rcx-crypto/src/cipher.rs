//! Per-chunk AEAD seal/open
//!
//! No associated data is bound: a chunk's position is authenticated by the
//! key ring itself, since only the previous chunk in the ring knows its key.

use aes_gcm::Aes256Gcm;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    ChaCha20Poly1305,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CodecError;
use crate::frame::{parse_frame, Algorithm, ChunkFrame};
use crate::key::ChunkKey;
use crate::IV_SIZE;

/// Plaintext of one chunk plus what its frame said about the ring.
#[derive(Debug)]
pub struct DecryptedChunk {
    pub plaintext: Vec<u8>,
    pub next_key: Option<ChunkKey>,
    /// `None` when the frame carried no hash or verification was skipped.
    pub hash_verified: Option<bool>,
}

/// base64url (no padding) SHA-256 of `plaintext`, as embedded in frames.
pub fn content_hash(plaintext: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(plaintext))
}

/// Encrypt one chunk under `key`, optionally embedding the next key and
/// the plaintext hash.
pub fn seal_chunk(
    algorithm: Algorithm,
    key: &ChunkKey,
    plaintext: &[u8],
    next_key: Option<&ChunkKey>,
    with_hash: bool,
) -> Result<ChunkFrame, CodecError> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = match algorithm {
        Algorithm::Aes256Gcm => Aes256Gcm::new(key.as_bytes().into())
            .encrypt(GenericArray::from_slice(&iv), plaintext),
        Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.as_bytes().into())
            .encrypt(GenericArray::from_slice(&iv), plaintext),
    }
    .map_err(|e| CodecError::Encryption(e.to_string()))?;

    Ok(ChunkFrame {
        algorithm,
        iv,
        ciphertext,
        content_hash: with_hash.then(|| content_hash(plaintext)),
        next_key: next_key.cloned(),
    })
}

/// Decrypt a parsed frame. A hash mismatch is reported through
/// `hash_verified`, never as an error.
pub fn decrypt_frame(
    frame: &ChunkFrame,
    key: &ChunkKey,
    verify_hash: bool,
) -> Result<DecryptedChunk, CodecError> {
    let plaintext = match frame.algorithm {
        Algorithm::Aes256Gcm => Aes256Gcm::new(key.as_bytes().into())
            .decrypt(GenericArray::from_slice(&frame.iv), frame.ciphertext.as_slice()),
        Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.as_bytes().into())
            .decrypt(GenericArray::from_slice(&frame.iv), frame.ciphertext.as_slice()),
    }
    .map_err(|_| CodecError::DecryptionFailed)?;

    let hash_verified = match (&frame.content_hash, verify_hash) {
        (Some(expected), true) => {
            let ok = hash_matches(expected, &plaintext);
            if !ok {
                tracing::warn!(
                    expected = %expected,
                    actual = %content_hash(&plaintext),
                    "chunk content hash mismatch"
                );
            }
            Some(ok)
        }
        _ => None,
    };

    Ok(DecryptedChunk {
        plaintext,
        next_key: frame.next_key.clone(),
        hash_verified,
    })
}

/// Parse and decrypt raw frame bytes.
pub fn decrypt_chunk(
    bytes: &[u8],
    key: &ChunkKey,
    verify_hash: bool,
) -> Result<DecryptedChunk, CodecError> {
    let frame = parse_frame(bytes)?;
    decrypt_frame(&frame, key, verify_hash)
}

// Writers have used both base64 alphabets for the hash trailer.
fn hash_matches(expected: &str, plaintext: &[u8]) -> bool {
    let digest = Sha256::digest(plaintext);
    let expected = expected.trim();
    URL_SAFE_NO_PAD
        .decode(expected)
        .or_else(|_| STANDARD.decode(expected))
        .map(|bytes| bytes.as_slice() == digest.as_slice())
        .unwrap_or(false)
}
