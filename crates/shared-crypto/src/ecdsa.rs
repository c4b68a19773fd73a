//! # Recoverable ECDSA (secp256k1)
//!
//! Ethereum-compatible signatures: 65 bytes `r || s || v`, with the signer
//! address recoverable from the signature alone.
//!
//! ## Security Properties
//!
//! - RFC 6979 deterministic nonces (no RNG dependency for signing)
//! - Secret key material zeroized on drop

use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use zeroize::Zeroize;

use shared_types::{Address, Hash, Signature};

use crate::hashing::{keccak256, personal_message_hash};
use crate::CryptoError;

/// Port for anything able to sign on behalf of the local account.
///
/// Implemented by [`LocalSigner`] for in-process keys; a hardware or remote
/// wallet adapter implements the same contract.
pub trait Signer: Send + Sync {
    /// The account address signatures recover to.
    fn address(&self) -> Address;

    /// Sign arbitrary bytes under the personal-message prefix.
    fn sign_message(&self, data: &[u8]) -> Result<Signature, CryptoError>;
}

/// In-process secp256k1 signer.
pub struct LocalSigner {
    signing_key: SigningKey,
    address: Address,
}

impl LocalSigner {
    /// Generate a random signer (tests, throwaway identities).
    #[must_use]
    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::thread_rng()))
    }

    /// Create from secret key bytes (32 bytes).
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_bytes((&bytes).into()).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of_key(signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    /// Sign a 32-byte digest, returning the 65-byte recoverable signature.
    pub fn sign_hash(&self, digest: &Hash) -> Result<Signature, CryptoError> {
        let (sig, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|_| CryptoError::SigningFailed)?;
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = 27 + recovery_id.to_byte();
        Ok(Signature::new(bytes))
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn sign_message(&self, data: &[u8]) -> Result<Signature, CryptoError> {
        self.sign_hash(&personal_message_hash(data))
    }
}

impl Drop for LocalSigner {
    fn drop(&mut self) {
        let mut bytes: [u8; 32] = self.signing_key.to_bytes().into();
        bytes.zeroize();
    }
}

/// Recover the address that signed `data` under the personal-message prefix.
pub fn recover_signer(data: &[u8], signature: &Signature) -> Result<Address, CryptoError> {
    recover_from_hash(&personal_message_hash(data), signature)
}

/// Recover the signer address from a 32-byte digest and a 65-byte signature.
pub fn recover_from_hash(digest: &Hash, signature: &Signature) -> Result<Address, CryptoError> {
    let bytes = signature.as_bytes();
    let v = bytes[64];
    let recovery_id = RecoveryId::try_from(if v >= 27 { v - 27 } else { v })
        .map_err(|_| CryptoError::InvalidSignature)?;
    let sig = k256::ecdsa::Signature::from_slice(&bytes[..64])
        .map_err(|_| CryptoError::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &sig, recovery_id)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    Ok(address_of_key(&key))
}

/// Last 20 bytes of the keccak-256 of the uncompressed public key.
fn address_of_key(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    // skip the 0x04 uncompressed-point tag
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[12..]);
    Address::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_recover_roundtrip() {
        let signer = LocalSigner::random();
        let data = b"payment channel message";

        let signature = signer.sign_message(data).unwrap();
        let recovered = recover_signer(data, &signature).unwrap();

        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_wrong_message_recovers_other_address() {
        let signer = LocalSigner::random();
        let signature = signer.sign_message(b"message1").unwrap();

        match recover_signer(b"message2", &signature) {
            Ok(addr) => assert_ne!(addr, signer.address()),
            Err(err) => assert_eq!(err, CryptoError::RecoveryFailed),
        }
    }

    #[test]
    fn test_deterministic_signatures() {
        let signer = LocalSigner::from_bytes([0xAB; 32]).unwrap();
        let sig1 = signer.sign_message(b"deterministic").unwrap();
        let sig2 = signer.sign_message(b"deterministic").unwrap();
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_known_address_derivation() {
        // address is a pure function of the secret key
        let a = LocalSigner::from_bytes([0x01; 32]).unwrap().address();
        let b = LocalSigner::from_bytes([0x01; 32]).unwrap().address();
        assert_eq!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn test_zero_signature_rejected() {
        let digest = keccak256(b"data");
        let result = recover_from_hash(&digest, &Signature::default());
        assert!(result.is_err());
    }
}
