//! Content addressing for cached blobs
//!
//! Blobs are named after the hash the Hub reports for a file: the git blob
//! hash (SHA-1 over `blob <len>\0<content>`) for regular files, or the
//! SHA-256 of the content for large files stored through LFS.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::error::{CacheError, Result};

/// Hash identifying a blob in `blobs/`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlobHash {
    /// Git blob hash of a regular file
    GitSha1([u8; 20]),
    /// SHA-256 of an LFS file
    Sha256([u8; 32]),
}

impl BlobHash {
    /// Git blob hash of `data`
    pub fn git_sha1(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("blob {}\0", data.len()).as_bytes());
        hasher.update(data);
        Self::GitSha1(hasher.finalize().into())
    }

    /// SHA-256 of `data`
    pub fn sha256(data: &[u8]) -> Self {
        Self::Sha256(Sha256::digest(data).into())
    }

    /// Parse from hexadecimal string; the length selects the algorithm
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let invalid = || CacheError::InvalidHash(hex_str.to_string());
        let bytes = hex::decode(hex_str).map_err(|_| invalid())?;
        match bytes.len() {
            20 => {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(&bytes);
                Ok(Self::GitSha1(arr))
            }
            32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self::Sha256(arr))
            }
            _ => Err(invalid()),
        }
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::GitSha1(b) => b,
            Self::Sha256(b) => b,
        }
    }

    pub fn is_lfs(&self) -> bool {
        matches!(self, Self::Sha256(_))
    }

    /// Hash `data` with the same algorithm as `self`
    pub fn rehash(&self, data: &[u8]) -> Self {
        match self {
            Self::GitSha1(_) => Self::git_sha1(data),
            Self::Sha256(_) => Self::sha256(data),
        }
    }

    /// Check `data` hashes to `self`
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = self.rehash(data);
        if actual == *self {
            Ok(())
        } else {
            Err(CacheError::HashMismatch {
                expected: self.to_hex(),
                actual: actual.to_hex(),
            })
        }
    }

    /// Stream the file at `path` through the matching hasher
    pub fn verify_file(&self, path: &Path) -> Result<()> {
        let actual = self.hash_file(path)?;
        if actual == *self {
            Ok(())
        } else {
            Err(CacheError::HashMismatch {
                expected: self.to_hex(),
                actual: actual.to_hex(),
            })
        }
    }

    /// Both names a file could be stored under, git blob hash first.
    ///
    /// Used for snapshot copies, which carry no link to their blob.
    pub fn candidates_for_file(path: &Path) -> Result<[Self; 2]> {
        let mut file = std::fs::File::open(path)?;
        let mut git = Sha1::new();
        git.update(format!("blob {}\0", file.metadata()?.len()).as_bytes());
        let mut lfs = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            git.update(&buf[..n]);
            lfs.update(&buf[..n]);
        }
        Ok([
            Self::GitSha1(git.finalize().into()),
            Self::Sha256(lfs.finalize().into()),
        ])
    }

    fn hash_file(&self, path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = vec![0u8; 64 * 1024];
        match self {
            Self::GitSha1(_) => {
                let len = file.metadata()?.len();
                let mut hasher = Sha1::new();
                hasher.update(format!("blob {}\0", len).as_bytes());
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(Self::GitSha1(hasher.finalize().into()))
            }
            Self::Sha256(_) => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(Self::Sha256(hasher.finalize().into()))
            }
        }
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BlobHash {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}
