//! # Domain Primitives
//!
//! Address, hash and signature newtypes with strict wire validation.
//!
//! All of these serialize to `0x`-prefixed hex strings; deserialization is
//! the validation boundary, so malformed external data never enters the
//! engine as a typed value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::errors::EngineError;

pub use primitive_types::U256;

/// 256-bit token amount, as enforceable on-chain.
pub type TokenAmount = U256;

/// Block number on the anchoring chain.
pub type BlockNumber = u64;

/// A 20-byte account address, displayed EIP-55 checksummed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// EIP-55 checksummed string representation, `0x`-prefixed.
    #[must_use]
    pub fn checksummed(&self) -> String {
        let lower = hex::encode(self.0);
        let digest = Keccak256::digest(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let byte = digest[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            if nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Lowercased hex representation, used for deterministic orderings
    /// (transport user localparts, call-id derivation).
    #[must_use]
    pub fn lowercased(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksummed())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.checksummed())
    }
}

impl FromStr for Address {
    type Err = EngineError;

    /// Parses a `0x`-prefixed address.
    ///
    /// Mixed-case inputs must carry a valid EIP-55 checksum; all-lowercase
    /// inputs are accepted and normalized.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("0x")
            .ok_or_else(|| EngineError::InvalidAddress(s.to_string()))?;
        if body.len() != 40 {
            return Err(EngineError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(body.to_ascii_lowercase(), &mut bytes)
            .map_err(|_| EngineError::InvalidAddress(s.to_string()))?;
        let address = Self(bytes);
        let is_lowercase = body.chars().all(|c| !c.is_ascii_uppercase());
        if !is_lowercase && address.checksummed() != s {
            return Err(EngineError::InvalidAddress(s.to_string()));
        }
        Ok(address)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.checksummed())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte hash (keccak-256 output, tx hashes, locksroots).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; 32]);

impl Hash {
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Keccak-256 of arbitrary bytes.
    #[must_use]
    pub fn keccak(data: &[u8]) -> Self {
        Self(Keccak256::digest(data).into())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("0x")
            .ok_or_else(|| EngineError::Decode(format!("invalid hash: {s}")))?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(body, &mut bytes)
            .map_err(|_| EngineError::Decode(format!("invalid hash: {s}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 65-byte recoverable ECDSA signature (r || s || v).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 65]);

impl Signature {
    #[must_use]
    pub const fn new(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 65])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(self.0))
    }
}

impl FromStr for Signature {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("0x")
            .ok_or_else(|| EngineError::Decode(format!("invalid signature: {s}")))?;
        let mut bytes = [0u8; 65];
        hex::decode_to_slice(body, &mut bytes)
            .map_err(|_| EngineError::Decode(format!("invalid signature: {s}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte transfer secret; its keccak-256 is the lock's secrethash.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The secrethash committing to this secret.
    #[must_use]
    pub fn secrethash(&self) -> Hash {
        Hash::keccak(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log the secret itself
        write!(f, "Secret({})", self.secrethash())
    }
}

impl FromStr for Secret {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("0x")
            .ok_or_else(|| EngineError::Decode("invalid secret".to_string()))?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(body, &mut bytes)
            .map_err(|_| EngineError::Decode("invalid secret".to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of a channel while it lives: the token network it belongs to and
/// the partner on the other side. At most one channel exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub token_network: Address,
    pub partner: Address,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.token_network, self.partner)
    }
}

impl FromStr for ChannelKey {
    type Err = EngineError;

    /// Parses the `<token_network>#<partner>` form produced by `Display`,
    /// used as a string map key in serialized state.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token_network, partner) = s
            .split_once('#')
            .ok_or_else(|| EngineError::InvalidAddress(s.to_string()))?;
        Ok(Self {
            token_network: token_network.parse()?,
            partner: partner.parse()?,
        })
    }
}

/// A pending transfer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub amount: TokenAmount,
    pub expiration: BlockNumber,
    pub secrethash: Hash,
}

/// The signed, monotonically-increasing summary of one side's channel state,
/// enforceable on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceProof {
    pub chain_id: U256,
    pub token_network: Address,
    pub channel_id: u64,
    pub nonce: u64,
    pub transferred_amount: TokenAmount,
    pub locked_amount: TokenAmount,
    pub locksroot: Hash,
    pub additional_hash: Hash,
    pub signature: Signature,
    pub sender: Address,
}

/// A signed promise-to-pay compensating an auxiliary service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedIou {
    pub sender: Address,
    pub receiver: Address,
    pub amount: TokenAmount,
    pub expiration_block: BlockNumber,
    pub chain_id: U256,
    pub signature: Signature,
}

/// Credentials of an authenticated transport session, persisted so the next
/// run can log back into the same server without re-registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCredentials {
    pub user_id: String,
    pub access_token: String,
    pub device_id: String,
    /// Signature of `user_id` by our account, proving ownership.
    pub display_name: String,
}
