//! Content keys for cached artifacts.
//!
//! A key is two fixed-length digests glued together: the primary digest
//! hashes the build inputs, the secondary digest hashes the build
//! parameters. Keys compare and order by raw byte value.

use std::fmt;

use thiserror::Error;

/// Length of one digest half in bytes (MD5-sized).
pub const DIGEST_SIZE: usize = 16;

/// Length of a full key on the wire and on disk.
pub const KEY_SIZE: usize = DIGEST_SIZE * 2;

/// A single digest half.
pub type Digest = [u8; DIGEST_SIZE];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidLength(usize),

    #[error("Invalid hex key: {0}")]
    InvalidHex(String),
}

/// Identifier of a cached artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_SIZE]);

impl CacheKey {
    /// Build a key from the inputs digest and the parameters digest.
    pub fn new(primary: Digest, secondary: Digest) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[..DIGEST_SIZE].copy_from_slice(&primary);
        bytes[DIGEST_SIZE..].copy_from_slice(&secondary);
        Self(bytes)
    }

    /// Build a key from exactly [`KEY_SIZE`] raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Parse a key from its 64-character hex form.
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        if text.len() != KEY_SIZE * 2 || !text.is_ascii() {
            return Err(KeyError::InvalidHex(text.to_string()));
        }
        let mut bytes = [0u8; KEY_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
                .map_err(|_| KeyError::InvalidHex(text.to_string()))?;
        }
        Ok(Self(bytes))
    }

    pub fn primary(&self) -> &[u8] {
        &self.0[..DIGEST_SIZE]
    }

    pub fn secondary(&self) -> &[u8] {
        &self.0[DIGEST_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}
