//! Content checksums used to namespace cached tables
//!
//! Digests are lowercase hex SHA-256. Configuration objects are hashed through
//! `serde_json::Value`, whose maps are ordered, so key order never changes a digest.

use crate::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 1 << 16;

/// Checksum of a string
#[must_use]
pub fn checksum_str(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}

/// Checksum of any serializable value, insensitive to map key order
///
/// # Errors
/// Returns error if the value cannot be serialized to JSON
pub fn checksum_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)?;
    Ok(checksum_str(&serde_json::to_string(&canonical)?))
}

/// Checksum of a file, streamed in fixed-size chunks
///
/// # Errors
/// Returns error if the file cannot be read
pub fn checksum_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Checksum of a sequence of digests, used to chain dataset keys
#[must_use]
pub fn combine<'a, I: IntoIterator<Item = &'a str>>(parts: I) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
