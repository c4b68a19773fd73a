//! # Canonical Packing and Signatures
//!
//! Messages are signed over a packed binary representation, not over their
//! JSON encoding, so signatures stay valid across codec changes. Envelope
//! messages sign the on-chain-verifiable balance proof layout; everything
//! else signs a command-id-prefixed field concatenation.

use shared_crypto::hashing::keccak256;
use shared_crypto::{recover_signer, CryptoError, Signer};
use shared_types::{Address, BalanceProof, Hash, Signature, TokenAmount, U256};
use thiserror::Error;
use tracing::debug;

use crate::types::{Envelope, Message, Metadata, WithdrawBase};

/// On-chain message type discriminators, shared with the settlement layer.
pub mod type_id {
    pub const BALANCE_PROOF: u64 = 1;
    pub const WITHDRAW: u64 = 3;
    pub const IOU: u64 = 5;
}

/// Errors from signing or verifying messages.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("message is not signed")]
    Unsigned,
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] CryptoError),
}

fn push_u256(out: &mut Vec<u8>, value: &U256) {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    out.extend_from_slice(&bytes);
}

fn push_u64_as_u256(out: &mut Vec<u8>, value: u64) {
    push_u256(out, &U256::from(value));
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// cmd id plus three bytes of padding, the prefix of non-envelope packings.
fn push_cmd(out: &mut Vec<u8>, cmd_id: u8) {
    out.extend_from_slice(&[cmd_id, 0, 0, 0]);
}

/// Hash committing to the route metadata of a locked transfer.
#[must_use]
pub fn metadata_hash(metadata: &Metadata) -> Hash {
    let route_hashes: Vec<Vec<u8>> = metadata
        .routes
        .iter()
        .map(|route_metadata| {
            let addresses: Vec<Vec<u8>> = route_metadata
                .route
                .iter()
                .map(|address| address.as_bytes().to_vec())
                .collect();
            keccak256(&rlp::encode_list::<Vec<u8>, _>(&addresses))
                .as_bytes()
                .to_vec()
        })
        .collect();
    keccak256(&rlp::encode_list::<Vec<u8>, _>(&route_hashes))
}

/// Commitment to one side's balance. All-zero balances hash to zero so a
/// fresh channel needs no proof at all.
#[must_use]
pub fn balance_hash(
    transferred_amount: TokenAmount,
    locked_amount: TokenAmount,
    locksroot: Hash,
) -> Hash {
    if transferred_amount.is_zero() && locked_amount.is_zero() && locksroot.is_zero() {
        return Hash::default();
    }
    let mut packed = Vec::with_capacity(96);
    push_u256(&mut packed, &transferred_amount);
    push_u256(&mut packed, &locked_amount);
    packed.extend_from_slice(locksroot.as_bytes());
    keccak256(&packed)
}

/// Hash of the message-specific fields of an envelope message; becomes the
/// balance proof's `additional_hash`.
#[must_use]
pub fn message_hash(message: &Message) -> Option<Hash> {
    let mut packed = Vec::new();
    packed.push(message.cmd_id());
    match message {
        Message::LockedTransfer(m) => {
            push_u64(&mut packed, m.message_identifier);
            push_u64(&mut packed, m.payment_identifier);
            push_u64_as_u256(&mut packed, m.lock.expiration);
            packed.extend_from_slice(m.token.as_bytes());
            packed.extend_from_slice(m.recipient.as_bytes());
            packed.extend_from_slice(m.target.as_bytes());
            packed.extend_from_slice(m.initiator.as_bytes());
            packed.extend_from_slice(m.lock.secrethash.as_bytes());
            push_u256(&mut packed, &m.lock.amount);
            packed.extend_from_slice(metadata_hash(&m.metadata).as_bytes());
        }
        Message::RefundTransfer(m) => {
            push_u64(&mut packed, m.message_identifier);
            push_u64(&mut packed, m.payment_identifier);
            push_u64_as_u256(&mut packed, m.lock.expiration);
            packed.extend_from_slice(m.token.as_bytes());
            packed.extend_from_slice(m.recipient.as_bytes());
            packed.extend_from_slice(m.target.as_bytes());
            packed.extend_from_slice(m.initiator.as_bytes());
            packed.extend_from_slice(m.lock.secrethash.as_bytes());
            push_u256(&mut packed, &m.lock.amount);
        }
        Message::Unlock(m) => {
            push_u64(&mut packed, m.message_identifier);
            push_u64(&mut packed, m.payment_identifier);
            packed.extend_from_slice(m.secret.as_bytes());
        }
        Message::LockExpired(m) => {
            push_u64(&mut packed, m.message_identifier);
            packed.extend_from_slice(m.recipient.as_bytes());
            packed.extend_from_slice(m.secrethash.as_bytes());
        }
        _ => return None,
    }
    Some(keccak256(&packed))
}

fn pack_envelope(envelope: &Envelope, additional_hash: Hash) -> Vec<u8> {
    let mut packed = Vec::with_capacity(212);
    packed.extend_from_slice(envelope.token_network_address.as_bytes());
    push_u256(&mut packed, &envelope.chain_id);
    push_u64_as_u256(&mut packed, type_id::BALANCE_PROOF);
    push_u64_as_u256(&mut packed, envelope.channel_identifier);
    packed.extend_from_slice(
        balance_hash(
            envelope.transferred_amount,
            envelope.locked_amount,
            envelope.locksroot,
        )
        .as_bytes(),
    );
    push_u64_as_u256(&mut packed, envelope.nonce);
    packed.extend_from_slice(additional_hash.as_bytes());
    packed
}

fn pack_withdraw(base: &WithdrawBase) -> Vec<u8> {
    let mut packed = Vec::with_capacity(200);
    packed.extend_from_slice(base.token_network_address.as_bytes());
    push_u256(&mut packed, &base.chain_id);
    push_u64_as_u256(&mut packed, type_id::WITHDRAW);
    push_u64_as_u256(&mut packed, base.channel_identifier);
    packed.extend_from_slice(base.participant.as_bytes());
    push_u256(&mut packed, &base.total_withdraw);
    push_u64_as_u256(&mut packed, base.expiration);
    packed
}

/// Pack a message into the byte layout that gets signed.
#[must_use]
pub fn pack(message: &Message) -> Vec<u8> {
    match message {
        Message::Delivered(m) => {
            let mut packed = Vec::with_capacity(12);
            push_cmd(&mut packed, message.cmd_id());
            push_u64(&mut packed, m.delivered_message_identifier);
            packed
        }
        Message::Processed(m) => {
            let mut packed = Vec::with_capacity(12);
            push_cmd(&mut packed, message.cmd_id());
            push_u64(&mut packed, m.message_identifier);
            packed
        }
        Message::SecretRequest(m) => {
            let mut packed = Vec::with_capacity(116);
            push_cmd(&mut packed, message.cmd_id());
            push_u64(&mut packed, m.message_identifier);
            push_u64(&mut packed, m.payment_identifier);
            packed.extend_from_slice(m.secrethash.as_bytes());
            push_u256(&mut packed, &m.amount);
            push_u64_as_u256(&mut packed, m.expiration);
            packed
        }
        Message::SecretReveal(m) => {
            let mut packed = Vec::with_capacity(44);
            push_cmd(&mut packed, message.cmd_id());
            push_u64(&mut packed, m.message_identifier);
            packed.extend_from_slice(m.secret.as_bytes());
            packed
        }
        Message::LockedTransfer(m) => {
            // message_hash always exists for envelope messages
            let additional = message_hash(message).unwrap_or_default();
            pack_envelope(&m.envelope, additional)
        }
        Message::RefundTransfer(m) => {
            let additional = message_hash(message).unwrap_or_default();
            pack_envelope(&m.envelope, additional)
        }
        Message::Unlock(m) => {
            let additional = message_hash(message).unwrap_or_default();
            pack_envelope(&m.envelope, additional)
        }
        Message::LockExpired(m) => {
            let additional = message_hash(message).unwrap_or_default();
            pack_envelope(&m.envelope, additional)
        }
        Message::WithdrawRequest(m) => pack_withdraw(&m.base),
        Message::WithdrawConfirmation(m) => pack_withdraw(&m.base),
        Message::WithdrawExpired(m) => {
            let mut packed = Vec::with_capacity(244);
            push_cmd(&mut packed, message.cmd_id());
            push_u64_as_u256(&mut packed, m.base.nonce);
            push_u64(&mut packed, m.message_identifier);
            packed.extend_from_slice(&pack_withdraw(&m.base));
            packed
        }
    }
}

/// Sign `message` in place with `signer`. Already-signed messages pass
/// through untouched.
pub fn sign_message(signer: &dyn Signer, message: &mut Message) -> Result<(), CryptoError> {
    if message.is_signed() {
        return Ok(());
    }
    debug!(cmd = message.cmd_id(), "signing message");
    let signature = signer.sign_message(&pack(message))?;
    message.set_signature(signature);
    Ok(())
}

/// Recover the address that signed `message`.
pub fn message_signer(message: &Message) -> Result<Address, SignatureError> {
    let signature = message.signature().ok_or(SignatureError::Unsigned)?;
    Ok(recover_signer(&pack(message), signature)?)
}

/// Extract the enforceable balance proof carried by an envelope message.
///
/// Returns `None` for messages without an envelope; fails if the message is
/// unsigned, since an unsigned proof is worthless.
pub fn balance_proof_from_message(
    message: &Message,
) -> Result<Option<BalanceProof>, SignatureError> {
    let Some(envelope) = message.envelope() else {
        return Ok(None);
    };
    let signature = *message.signature().ok_or(SignatureError::Unsigned)?;
    let sender = message_signer(message)?;
    Ok(Some(BalanceProof {
        chain_id: envelope.chain_id,
        token_network: envelope.token_network_address,
        channel_id: envelope.channel_identifier,
        nonce: envelope.nonce,
        transferred_amount: envelope.transferred_amount,
        locked_amount: envelope.locked_amount,
        locksroot: envelope.locksroot,
        additional_hash: message_hash(message).unwrap_or_default(),
        signature,
        sender,
    }))
}
