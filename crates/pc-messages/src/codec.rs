//! # JSON Codec
//!
//! Canonical JSON wire format: the `type` tag discriminates, field order
//! follows the type declarations, and 256-bit amounts travel as decimal
//! strings so no reader needs big-number-lossy float parsing.

use thiserror::Error;

use crate::types::Message;

/// Errors from decoding inbound text.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid message: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Encode a message as its canonical JSON string.
pub fn encode_message(message: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode inbound text into a message, validating every field.
pub fn decode_message(text: &str) -> Result<Message, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Serde helpers for 256-bit amounts as decimal strings.
pub(crate) mod amount {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use shared_types::U256;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let text = String::deserialize(deserializer)?;
        U256::from_dec_str(&text).map_err(de::Error::custom)
    }
}
