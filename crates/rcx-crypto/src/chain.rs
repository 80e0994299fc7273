//! Key ring traversal
//!
//! The initial key opens chunk N-1, whose frame yields the key of chunk 0;
//! from there each chunk yields the key of its successor. The last chunk
//! processed (N-2, or the only chunk when N = 1) closes the ring: if it
//! carries a next key, that key must equal the initial key.

use crate::cipher::{decrypt_chunk, seal_chunk, DecryptedChunk};
use crate::error::CodecError;
use crate::frame::{encode_frame, Algorithm};
use crate::key::ChunkKey;

/// Incremental chain decryptor. Feed chunks in the order `next_index()`
/// asks for; each one is decrypted as soon as it is accepted.
#[derive(Debug)]
pub struct ChainDecryptor {
    total: usize,
    step: usize,
    initial_key: ChunkKey,
    current_key: Option<ChunkKey>,
    verify_hash: bool,
}

impl ChainDecryptor {
    pub fn new(total: usize, initial_key: ChunkKey) -> Result<Self, CodecError> {
        if total == 0 {
            return Err(CodecError::EmptyChain);
        }
        Ok(Self {
            total,
            step: 0,
            current_key: Some(initial_key.clone()),
            initial_key,
            verify_hash: true,
        })
    }

    pub fn verify_hash(mut self, verify: bool) -> Self {
        self.verify_hash = verify;
        self
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// The chunk index that must be accepted next, or `None` once the ring
    /// has been fully walked.
    pub fn next_index(&self) -> Option<usize> {
        match self.step {
            s if s >= self.total => None,
            0 => Some(self.total - 1),
            s => Some(s - 1),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.step >= self.total
    }

    /// Decrypt the chunk at `index`, which must be `next_index()`.
    pub fn accept(&mut self, index: usize, bytes: &[u8]) -> Result<DecryptedChunk, CodecError> {
        let expected = self.next_index().ok_or_else(|| CodecError::BrokenKeyChain {
            index,
            reason: "chain already complete".into(),
        })?;
        if index != expected {
            return Err(CodecError::BrokenKeyChain {
                index,
                reason: format!("out of chain order, expected chunk {expected}"),
            });
        }
        let key = self.current_key.take().ok_or_else(|| CodecError::BrokenKeyChain {
            index,
            reason: "no key available".into(),
        })?;

        let chunk = decrypt_chunk(bytes, &key, self.verify_hash)?;
        self.step += 1;

        if self.is_complete() {
            if let Some(next) = &chunk.next_key {
                if *next != self.initial_key {
                    return Err(CodecError::BrokenKeyChain {
                        index,
                        reason: "ring does not close: next key differs from initial key".into(),
                    });
                }
            }
        } else {
            let next = chunk.next_key.clone().ok_or_else(|| CodecError::BrokenKeyChain {
                index,
                reason: "frame carries no next key".into(),
            })?;
            self.current_key = Some(next);
        }
        Ok(chunk)
    }
}

/// Decrypt a complete ring of frames (index order) into the concatenated
/// plaintext. Chunks are decrypted in chain order, concatenated in index order.
pub fn decrypt_chain<B: AsRef<[u8]>>(
    chunks: &[B],
    initial_key: &ChunkKey,
) -> Result<Vec<u8>, CodecError> {
    let mut cursor = ChainDecryptor::new(chunks.len(), initial_key.clone())?;
    let mut plaintexts: Vec<Vec<u8>> = vec![Vec::new(); chunks.len()];
    while let Some(index) = cursor.next_index() {
        plaintexts[index] = cursor.accept(index, chunks[index].as_ref())?.plaintext;
    }
    Ok(plaintexts.concat())
}

/// Encoded frames of a ring plus the key that opens it.
#[derive(Debug)]
pub struct SealedChain {
    pub frames: Vec<Vec<u8>>,
    pub initial_key: ChunkKey,
}

/// Encrypt plaintext slices into a ring with freshly generated keys.
pub fn encrypt_chain<B: AsRef<[u8]>>(
    chunks: &[B],
    algorithm: Algorithm,
) -> Result<SealedChain, CodecError> {
    let keys: Vec<ChunkKey> = (0..chunks.len()).map(|_| ChunkKey::generate()).collect();
    encrypt_chain_with_keys(chunks, &keys, algorithm)
}

/// Encrypt chunk `i` under `keys[i]`, embedding `keys[(i + 1) % N]` and the
/// plaintext hash. The ring opens with `keys[N - 1]`.
pub fn encrypt_chain_with_keys<B: AsRef<[u8]>>(
    chunks: &[B],
    keys: &[ChunkKey],
    algorithm: Algorithm,
) -> Result<SealedChain, CodecError> {
    if chunks.is_empty() {
        return Err(CodecError::EmptyChain);
    }
    if keys.len() != chunks.len() {
        return Err(CodecError::InvalidKey(format!(
            "{} keys for {} chunks",
            keys.len(),
            chunks.len()
        )));
    }
    let n = chunks.len();
    let frames = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            seal_chunk(algorithm, &keys[i], chunk.as_ref(), Some(&keys[(i + 1) % n]), true)
                .map(|frame| encode_frame(&frame))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SealedChain {
        frames,
        initial_key: keys[n - 1].clone(),
    })
}
