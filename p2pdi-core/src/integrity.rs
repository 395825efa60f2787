//! Integrity: whole-document SHA-256 digest, sent with GetRFC responses and
//! checked by the fetching peer. A mismatching document is discarded.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a document's content.
pub fn digest_document(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Verify content against an expected hex digest (case-insensitive).
pub fn verify_document(content: &str, expected: &str) -> bool {
    digest_document(content).eq_ignore_ascii_case(expected.trim())
}
