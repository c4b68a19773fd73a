//! # Protocol Messages
//!
//! The signed off-chain message layer: typed message definitions, the
//! canonical JSON codec and the packed binary representations that get
//! signed and verified. Balance proofs are extracted from envelope messages
//! here, never constructed ad hoc.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod codec;
pub mod packing;
pub mod types;

pub use codec::{decode_message, encode_message, CodecError};
pub use packing::{
    balance_hash, balance_proof_from_message, message_hash, message_signer, metadata_hash, pack,
    sign_message, type_id, SignatureError,
};
pub use types::{
    Delivered, Envelope, LockExpired, LockedTransfer, Message, Metadata, Processed,
    RefundTransfer, RouteMetadata, SecretRequest, SecretReveal, Unlock, WithdrawBase,
    WithdrawConfirmation, WithdrawExpired, WithdrawRequest,
};
