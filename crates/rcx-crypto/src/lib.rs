//! rcx-crypto: chunk codec for key-chained encrypted transfers
//!
//! Every chunk is sealed with its own 256-bit key. The frame of chunk `i`
//! carries the key of chunk `i + 1`, and the last chunk carries the key of
//! chunk 0, so the keys form a ring:
//!
//! ```text
//! initial key ──▶ chunk N-1 ──next──▶ chunk 0 ──next──▶ chunk 1 … chunk N-2 ──next──▶ (key of N-1)
//! ```
//!
//! Frame layout:
//! ```text
//! [0x52 0x50][version 0x01][alg][12-byte IV][ciphertext + 16-byte tag]
//!     ["\n--HASH--\n" base64url(SHA-256(plaintext))]
//!     ["\n--NEXT_KEY--\n" base64(next key)]
//! ```

pub mod chain;
pub mod cipher;
pub mod error;
pub mod frame;
pub mod key;

pub use chain::{decrypt_chain, encrypt_chain, encrypt_chain_with_keys, ChainDecryptor, SealedChain};
pub use cipher::{content_hash, decrypt_chunk, decrypt_frame, seal_chunk, DecryptedChunk};
pub use error::CodecError;
pub use frame::{encode_frame, parse_frame, Algorithm, ChunkFrame};
pub use key::ChunkKey;

/// Size of a chunk key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce carried in every frame (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of the AEAD authentication tag
pub const TAG_SIZE: usize = 16;
