//! Checksum utilities for upload integrity

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// SHA-256 of `data`, base64 encoded.
///
/// This is the form S3 expects in the `x-amz-checksum-sha256` header of each part.
pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}
