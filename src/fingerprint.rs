//! Content fingerprinting
//!
//! A fingerprint is the SHA-256 of the file bytes plus the file size. It is
//! the unit of identity the whole pipeline dedups on: same fingerprint,
//! same upload work.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};
use crate::types::Fingerprint;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Compute the fingerprint of a file by streaming its content.
///
/// Returns `FilesystemAccess` if the file cannot be opened or read; callers
/// treat that as transient (the file may reappear or unlock).
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let mut file = File::open(path).map_err(|e| RelayError::FilesystemAccess {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut size: u64 = 0;

    loop {
        let n = file.read(&mut buf).map_err(|e| RelayError::FilesystemAccess {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(Fingerprint {
        hash: hex::encode(hasher.finalize()),
        size,
    })
}

/// Fingerprint in-memory bytes (used by workers to re-validate content
/// they have already read)
pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint {
        hash: hex::encode(hasher.finalize()),
        size: bytes.len() as u64,
    }
}
