//! Content-addressed migration fingerprints.
//!
//! A migration's identity is the SHA-256 of its normalized content, so the
//! same file produces the same checksum whether it was checked out with LF
//! or CRLF line endings, or saved with a UTF-8 byte-order mark.

use sha2::{Digest, Sha256};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Normalize file content for hashing: strip a single leading BOM and fold
/// every `\r\n` and stray `\r` down to `\n`.
///
/// This is intentionally more aggressive than the parser's line-ending
/// handling, which folds `\r\n` only. The two must not be unified.
fn normalize(bytes: &[u8]) -> Vec<u8> {
    let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    out
}

/// Compute the 64-hex-digit fingerprint of a migration file's content.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(normalize(bytes)))
}

/// Compare content against a recorded checksum, case-insensitively.
/// An empty expected value never matches.
pub fn verify(bytes: &[u8], expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    checksum(bytes) == expected.to_ascii_lowercase()
}

/// Whether `s` has the shape of a checksum: exactly 64 hex characters.
pub fn is_valid(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
