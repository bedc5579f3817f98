use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Lowercase hex SHA-256 over the concatenation of `chunks`.
pub fn sha256_hex(chunks: &[Bytes]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    format!("{:x}", hasher.finalize())
}

/// Checks the assembled payload against an expected digest (case-insensitive).
pub fn verify_sha256(chunks: &[Bytes], expected: &str) -> Result<(), IntegrityError> {
    let actual = sha256_hex(chunks);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        })
    }
}
