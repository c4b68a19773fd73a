//! # Protocol Message Types
//!
//! Every off-chain message exchanged between clients. The JSON wire format
//! is canonical: field order follows the struct declarations, 256-bit
//! amounts are decimal strings, and the `type` tag discriminates variants.
//! Envelope messages (those carrying a balance proof) share the same balance
//! fields so the proof can be extracted uniformly.

use serde::{Deserialize, Serialize};
use shared_types::{Address, Hash, Lock, Secret, Signature, TokenAmount, U256};

use crate::codec::amount;

/// Route hints attached to a locked transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMetadata {
    pub route: Vec<Address>,
}

/// Transfer metadata: the candidate routes, in order of preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub routes: Vec<RouteMetadata>,
}

/// Balance fields shared by every envelope message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "amount")]
    pub chain_id: U256,
    pub token_network_address: Address,
    pub channel_identifier: u64,
    pub nonce: u64,
    #[serde(with = "amount")]
    pub transferred_amount: TokenAmount,
    #[serde(with = "amount")]
    pub locked_amount: TokenAmount,
    pub locksroot: Hash,
}

/// Acknowledges receipt of a retriable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivered {
    pub delivered_message_identifier: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Confirms a state-changing message was validated and applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processed {
    pub message_identifier: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Target asks the initiator to reveal the secret of a pending transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRequest {
    pub message_identifier: u64,
    pub payment_identifier: u64,
    pub secrethash: Hash,
    #[serde(with = "amount")]
    pub amount: TokenAmount,
    pub expiration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Reveals a transfer secret off-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReveal {
    pub message_identifier: u64,
    pub secret: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// A mediated transfer locking an amount behind a secrethash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedTransfer {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message_identifier: u64,
    pub payment_identifier: u64,
    pub token: Address,
    pub recipient: Address,
    pub lock: Lock,
    pub target: Address,
    pub initiator: Address,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Mediator bounces a transfer back with the same secrethash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundTransfer {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message_identifier: u64,
    pub payment_identifier: u64,
    pub token: Address,
    pub recipient: Address,
    pub lock: Lock,
    pub target: Address,
    pub initiator: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// New balance proof without the lock, completing a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unlock {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message_identifier: u64,
    pub payment_identifier: u64,
    pub secret: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Removes an expired lock from the locks tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockExpired {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub message_identifier: u64,
    pub recipient: Address,
    pub secrethash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Fields shared by the withdraw negotiation messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawBase {
    #[serde(with = "amount")]
    pub chain_id: U256,
    pub token_network_address: Address,
    pub channel_identifier: u64,
    pub participant: Address,
    #[serde(with = "amount")]
    pub total_withdraw: TokenAmount,
    pub nonce: u64,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    #[serde(flatten)]
    pub base: WithdrawBase,
    pub message_identifier: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawConfirmation {
    #[serde(flatten)]
    pub base: WithdrawBase,
    pub message_identifier: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawExpired {
    #[serde(flatten)]
    pub base: WithdrawBase,
    pub message_identifier: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// The full off-chain message taxonomy, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Delivered(Delivered),
    Processed(Processed),
    SecretRequest(SecretRequest),
    #[serde(rename = "RevealSecret")]
    SecretReveal(SecretReveal),
    LockedTransfer(LockedTransfer),
    RefundTransfer(RefundTransfer),
    Unlock(Unlock),
    LockExpired(LockExpired),
    WithdrawRequest(WithdrawRequest),
    WithdrawConfirmation(WithdrawConfirmation),
    WithdrawExpired(WithdrawExpired),
}

impl Message {
    /// One-byte command id used in the packed representation.
    #[must_use]
    pub fn cmd_id(&self) -> u8 {
        match self {
            Self::Processed(_) => 0,
            Self::SecretRequest(_) => 3,
            Self::Unlock(_) => 4,
            Self::LockedTransfer(_) => 7,
            Self::RefundTransfer(_) => 8,
            Self::SecretReveal(_) => 11,
            Self::Delivered(_) => 12,
            Self::LockExpired(_) => 13,
            Self::WithdrawRequest(_) => 15,
            Self::WithdrawConfirmation(_) => 16,
            Self::WithdrawExpired(_) => 17,
        }
    }

    /// The envelope, for messages carrying a balance proof.
    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::LockedTransfer(m) => Some(&m.envelope),
            Self::RefundTransfer(m) => Some(&m.envelope),
            Self::Unlock(m) => Some(&m.envelope),
            Self::LockExpired(m) => Some(&m.envelope),
            _ => None,
        }
    }

    /// Identifier to acknowledge with a `Delivered`, for retriable messages.
    #[must_use]
    pub fn message_identifier(&self) -> Option<u64> {
        match self {
            Self::Processed(m) => Some(m.message_identifier),
            Self::SecretRequest(m) => Some(m.message_identifier),
            Self::SecretReveal(m) => Some(m.message_identifier),
            Self::LockedTransfer(m) => Some(m.message_identifier),
            Self::RefundTransfer(m) => Some(m.message_identifier),
            Self::Unlock(m) => Some(m.message_identifier),
            Self::LockExpired(m) => Some(m.message_identifier),
            Self::WithdrawRequest(m) => Some(m.message_identifier),
            Self::WithdrawConfirmation(m) => Some(m.message_identifier),
            Self::WithdrawExpired(m) => Some(m.message_identifier),
            Self::Delivered(_) => None,
        }
    }

    #[must_use]
    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Self::Delivered(m) => m.signature.as_ref(),
            Self::Processed(m) => m.signature.as_ref(),
            Self::SecretRequest(m) => m.signature.as_ref(),
            Self::SecretReveal(m) => m.signature.as_ref(),
            Self::LockedTransfer(m) => m.signature.as_ref(),
            Self::RefundTransfer(m) => m.signature.as_ref(),
            Self::Unlock(m) => m.signature.as_ref(),
            Self::LockExpired(m) => m.signature.as_ref(),
            Self::WithdrawRequest(m) => m.signature.as_ref(),
            Self::WithdrawConfirmation(m) => m.signature.as_ref(),
            Self::WithdrawExpired(m) => m.signature.as_ref(),
        }
    }

    pub(crate) fn set_signature(&mut self, signature: Signature) {
        let slot = match self {
            Self::Delivered(m) => &mut m.signature,
            Self::Processed(m) => &mut m.signature,
            Self::SecretRequest(m) => &mut m.signature,
            Self::SecretReveal(m) => &mut m.signature,
            Self::LockedTransfer(m) => &mut m.signature,
            Self::RefundTransfer(m) => &mut m.signature,
            Self::Unlock(m) => &mut m.signature,
            Self::LockExpired(m) => &mut m.signature,
            Self::WithdrawRequest(m) => &mut m.signature,
            Self::WithdrawConfirmation(m) => &mut m.signature,
            Self::WithdrawExpired(m) => &mut m.signature,
        };
        *slot = Some(signature);
    }

    /// Whether this message carries a signature.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.signature().is_some()
    }
}
