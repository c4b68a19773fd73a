//! # Keccak Hashing
//!
//! keccak-256 plus the Ethereum personal-message prefix scheme used for all
//! off-chain signatures, so signed payloads can never be confused with
//! transactions.

use sha3::{Digest, Keccak256};
use shared_types::Hash;

/// keccak-256 of arbitrary bytes.
#[must_use]
pub fn keccak256(data: &[u8]) -> Hash {
    Hash::new(Keccak256::digest(data).into())
}

/// Hash of `data` under the `\x19Ethereum Signed Message:\n<len>` prefix.
///
/// This is the digest actually signed/recovered for every off-chain message
/// (packed envelope bytes, transport credential derivations).
#[must_use]
pub fn personal_message_hash(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(data.len().to_string().as_bytes());
    hasher.update(data);
    Hash::new(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_empty() {
        // well-known keccak-256 of empty input
        assert_eq!(
            keccak256(&[]).to_string(),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_personal_hash_differs_from_plain() {
        let data = b"hello";
        assert_ne!(keccak256(data), personal_message_hash(data));
    }

    #[test]
    fn test_personal_hash_includes_length() {
        assert_ne!(
            personal_message_hash(b"aa"),
            personal_message_hash(b"aaa")
        );
    }
}
