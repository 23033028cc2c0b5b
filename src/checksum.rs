//! Content fingerprints for raw message bytes.
//!
//! The fingerprint is the first 16 hex characters of the SHA-256 digest of the
//! exact bytes as received. It names files and drives deduplication, so the
//! same message fetched over IMAP, POP3 or extracted from a PST must hash the
//! same way.

use ring::digest::{digest, SHA256};

pub const CHECKSUM_LEN: usize = 16;

pub fn checksum(bytes: &[u8]) -> String {
    let hash = digest(&SHA256, bytes);
    let mut out = String::with_capacity(CHECKSUM_LEN);
    for byte in hash.as_ref().iter().take(CHECKSUM_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn is_checksum(value: &str) -> bool {
    value.len() == CHECKSUM_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
