//! # Shared Types - Domain Primitives
//!
//! The single source of truth for types shared between the engine crates.
//!
//! - [`primitives`]: checksummed [`Address`], [`Hash`], [`Signature`],
//!   256-bit amounts and channel identity keys
//! - [`config`]: default + user-overridable engine configuration
//! - [`errors`]: the engine-wide error taxonomy surfaced by the facade

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod errors;
pub mod primitives;

pub use config::{Caps, EngineConfig, PartialEngineConfig};
pub use errors::{EngineError, ShutdownReason};
pub use primitives::{
    Address, BalanceProof, BlockNumber, ChannelKey, Hash, Lock, Secret, Signature, SignedIou,
    TokenAmount, TransportCredentials, U256,
};
