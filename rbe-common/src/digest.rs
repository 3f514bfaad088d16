//! Content digests in the remote-execution `hash/size` form.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest '{0}' is not of the form HASH/SIZE")]
    MissingSeparator(String),

    #[error("digest hash '{0}' is not lowercase hex")]
    InvalidHash(String),

    #[error("digest size '{0}' is not a non-negative integer")]
    InvalidSize(String),
}

/// A content-addressed blob identifier: SHA-256 hex hash plus byte length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobDigest {
    pub hash: String,
    pub size_bytes: u64,
}

impl BlobDigest {
    pub fn new(hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// Digest of an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            hash: to_hex(&hasher.finalize()),
            size_bytes: data.len() as u64,
        }
    }

    /// Digest of a file's contents, streamed rather than read whole.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let size_bytes = io::copy(&mut file, &mut hasher)?;
        Ok(Self {
            hash: to_hex(&hasher.finalize()),
            size_bytes,
        })
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl FromStr for BlobDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| DigestError::MissingSeparator(s.to_string()))?;
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(DigestError::InvalidHash(hash.to_string()));
        }
        let size_bytes = size
            .parse::<u64>()
            .map_err(|_| DigestError::InvalidSize(size.to_string()))?;
        Ok(Self::new(hash, size_bytes))
    }
}

/// `hash/size` string for a file, as written into download stubs.
pub fn get_blob_digest(path: &Path) -> io::Result<String> {
    Ok(BlobDigest::of_file(path)?.to_string())
}
