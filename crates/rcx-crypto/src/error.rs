use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid chunk frame: {0}")]
    InvalidFrame(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Authentication failed: wrong key or tampered bytes.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("broken key chain at chunk {index}: {reason}")]
    BrokenKeyChain { index: usize, reason: String },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("a key chain needs at least one chunk")]
    EmptyChain,
}
