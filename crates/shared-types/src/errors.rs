//! # Error Taxonomy
//!
//! [`EngineError`] is what facade callers see: every rejected future carries
//! one of these, with enough context to render or log. Epics map transient
//! conditions to retries internally and only surface errors once retries
//! are exhausted for a request a caller is waiting on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{Address, ChannelKey};

/// Why the engine is shutting down. Carried by the terminal shutdown action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    /// User-requested stop.
    Stop,
    /// The signing account changed underneath us.
    AccountChanged,
    /// The chain/network changed underneath us.
    NetworkChanged,
    /// An epic failed fatally; the engine cannot continue half-alive.
    Failed(String),
}

impl ShutdownReason {
    /// Fatal shutdowns skip best-effort courtesies (e.g. peer hangups).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stopped"),
            Self::AccountChanged => write!(f, "account changed"),
            Self::NetworkChanged => write!(f, "network changed"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Typed errors surfaced by the engine facade and carried in failure actions.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("token not monitored, unknown token network: {0}")]
    UnknownTokenNetwork(Address),

    #[error("no channel for {0}")]
    NoChannelFound(ChannelKey),

    #[error("channel for {key} in unexpected state {state}")]
    InvalidChannelState { key: ChannelKey, state: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("secret and secrethash do not match")]
    SecretMismatch,

    #[error("transaction failed: {0}")]
    TxFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("engine is shutting down: {0}")]
    ShuttingDown(ShutdownReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_reason() {
        assert!(ShutdownReason::Failed("boom".to_string()).is_fatal());
        assert!(!ShutdownReason::Stop.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::Transport("login refused".to_string());
        assert_eq!(err.to_string(), "transport error: login refused");
    }

    #[test]
    fn test_error_serde_roundtrip() {
        let err = EngineError::SecretMismatch;
        let json = serde_json::to_string(&err).unwrap();
        let back: EngineError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
