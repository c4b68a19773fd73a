//! # Shared Crypto - Signing Primitives
//!
//! secp256k1 recoverable ECDSA and keccak-256 hashing, the only two
//! cryptographic primitives the engine needs: every off-chain message is
//! authenticated by recovering the signer address from a signature over a
//! canonical hash.
//!
//! Signing is stateless and safely callable concurrently from any task.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod ecdsa;
pub mod hashing;

pub use ecdsa::{recover_signer, LocalSigner, Signer};
pub use hashing::{keccak256, personal_message_hash};

use thiserror::Error;

/// Errors from cryptographic operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signature recovery failed")]
    RecoveryFailed,
    #[error("signing failed")]
    SigningFailed,
}
