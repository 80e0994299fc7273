//! Binary chunk frame: header, IV, ciphertext and optional trailers
//!
//! Trailers are located by scanning backward for the separators. The
//! next-key separator is searched first; the hash separator is only searched
//! in the bytes before it. Nothing in the frame is decoded as text except
//! the two trailer payloads.

use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;
use crate::key::ChunkKey;
use crate::{IV_SIZE, TAG_SIZE};

pub const MAGIC: [u8; 2] = [0x52, 0x50];
pub const FORMAT_VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 4;
pub const HASH_SEPARATOR: &[u8] = b"\n--HASH--\n";
pub const KEY_SEPARATOR: &[u8] = b"\n--NEXT_KEY--\n";

/// AEAD algorithm identified by the fourth header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Algorithm {
    pub fn id(self) -> u8 {
        match self {
            Self::Aes256Gcm => 0x01,
            Self::ChaCha20Poly1305 => 0x02,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, CodecError> {
        match id {
            0x01 => Ok(Self::Aes256Gcm),
            0x02 => Ok(Self::ChaCha20Poly1305),
            other => Err(CodecError::InvalidFrame(format!(
                "unknown algorithm id 0x{other:02x}"
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aes256Gcm => "aes-gcm",
            Self::ChaCha20Poly1305 => "chacha20",
        })
    }
}

impl FromStr for Algorithm {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-gcm" | "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            "chacha20" | "chacha20-poly1305" | "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(CodecError::InvalidFrame(format!(
                "unknown algorithm name {other:?}"
            ))),
        }
    }
}

/// A parsed (still encrypted) chunk frame.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    pub algorithm: Algorithm,
    pub iv: [u8; IV_SIZE],
    /// Ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
    /// base64url SHA-256 of the plaintext, if the frame carries one.
    pub content_hash: Option<String>,
    /// Key of the next chunk in the ring, if the frame carries one.
    pub next_key: Option<ChunkKey>,
}

/// Parse a raw frame. Fails with `InvalidFrame` on bad header bytes or a
/// frame too short for IV and tag, and `InvalidKey` on a malformed next key.
pub fn parse_frame(bytes: &[u8]) -> Result<ChunkFrame, CodecError> {
    let mut body_end = bytes.len();

    let next_key = match rfind(bytes, KEY_SEPARATOR) {
        Some(pos) => {
            let text = trailer_text(&bytes[pos + KEY_SEPARATOR.len()..], "next key")?;
            body_end = pos;
            Some(ChunkKey::from_base64(text)?)
        }
        None => None,
    };

    let content_hash = match rfind(&bytes[..body_end], HASH_SEPARATOR) {
        Some(pos) => {
            let text = trailer_text(&bytes[pos + HASH_SEPARATOR.len()..body_end], "hash")?;
            body_end = pos;
            Some(text.trim().to_string())
        }
        None => None,
    };

    let body = &bytes[..body_end];
    if body.len() < HEADER_SIZE {
        return Err(CodecError::InvalidFrame(format!(
            "frame too short for header: {} bytes",
            body.len()
        )));
    }
    if body[..2] != MAGIC {
        return Err(CodecError::InvalidFrame(format!(
            "bad magic bytes {:02x}{:02x}",
            body[0], body[1]
        )));
    }
    if body[2] != FORMAT_VERSION {
        return Err(CodecError::InvalidFrame(format!(
            "unsupported format version {}",
            body[2]
        )));
    }
    let algorithm = Algorithm::from_id(body[3])?;

    let min = HEADER_SIZE + IV_SIZE + TAG_SIZE;
    if body.len() < min {
        return Err(CodecError::InvalidFrame(format!(
            "frame too short: {} bytes (minimum {min})",
            body.len()
        )));
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&body[HEADER_SIZE..HEADER_SIZE + IV_SIZE]);

    Ok(ChunkFrame {
        algorithm,
        iv,
        ciphertext: body[HEADER_SIZE + IV_SIZE..].to_vec(),
        content_hash,
        next_key,
    })
}

/// Serialize a frame into its wire bytes.
pub fn encode_frame(frame: &ChunkFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        HEADER_SIZE + IV_SIZE + frame.ciphertext.len() + 128,
    );
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.push(frame.algorithm.id());
    out.extend_from_slice(&frame.iv);
    out.extend_from_slice(&frame.ciphertext);
    if let Some(hash) = &frame.content_hash {
        out.extend_from_slice(HASH_SEPARATOR);
        out.extend_from_slice(hash.as_bytes());
    }
    if let Some(key) = &frame.next_key {
        out.extend_from_slice(KEY_SEPARATOR);
        out.extend_from_slice(key.to_base64().as_bytes());
    }
    out
}

fn trailer_text<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str, CodecError> {
    std::str::from_utf8(bytes)
        .map_err(|_| CodecError::InvalidFrame(format!("{what} trailer is not UTF-8")))
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
