//! # Signaling Wire Format
//!
//! Negotiation messages travel as room events over the messaging transport,
//! one event type per signal kind with a small JSON body. Every body carries
//! the deterministic call id so stale signals from a previous attempt are
//! recognizable.

use serde::{Deserialize, Serialize};
use shared_types::Address;

pub const MSG_TYPE_OFFER: &str = "m.call.offer";
pub const MSG_TYPE_ANSWER: &str = "m.call.answer";
pub const MSG_TYPE_CANDIDATES: &str = "m.call.candidates";
pub const MSG_TYPE_HANGUP: &str = "m.call.hangup";

/// Session id both ends derive independently: the two addresses, lowercased,
/// sorted and joined. The side whose address sorts first is the caller.
#[must_use]
pub fn call_id(a: &Address, b: &Address) -> String {
    let mut parts = [a.lowercased(), b.lowercased()];
    parts.sort();
    parts.join("|")
}

/// Whether `own` takes the caller role against `peer`.
#[must_use]
pub fn is_caller(own: &Address, peer: &Address) -> bool {
    own.lowercased() < peer.lowercased()
}

/// One decoded negotiation signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSignal {
    Offer { call_id: String, sdp: String },
    Answer { call_id: String, sdp: String },
    Candidates { call_id: String, candidates: Vec<String> },
    Hangup { call_id: String },
}

impl PeerSignal {
    #[must_use]
    pub fn call_id(&self) -> &str {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::Candidates { call_id, .. }
            | Self::Hangup { call_id } => call_id,
        }
    }

    /// The room event type carrying this signal.
    #[must_use]
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Offer { .. } => MSG_TYPE_OFFER,
            Self::Answer { .. } => MSG_TYPE_ANSWER,
            Self::Candidates { .. } => MSG_TYPE_CANDIDATES,
            Self::Hangup { .. } => MSG_TYPE_HANGUP,
        }
    }

    /// JSON body for the room event.
    #[must_use]
    pub fn body(&self) -> String {
        let body = match self {
            Self::Offer { call_id, sdp } | Self::Answer { call_id, sdp } => SignalBody {
                call_id: call_id.clone(),
                sdp: Some(sdp.clone()),
                candidates: None,
            },
            Self::Candidates { call_id, candidates } => SignalBody {
                call_id: call_id.clone(),
                sdp: None,
                candidates: Some(candidates.clone()),
            },
            Self::Hangup { call_id } => SignalBody {
                call_id: call_id.clone(),
                sdp: None,
                candidates: None,
            },
        };
        // plain structs with string fields cannot fail to serialize
        serde_json::to_string(&body).unwrap_or_default()
    }

    /// Decode a room event into a signal, if the event type is ours.
    #[must_use]
    pub fn decode(msg_type: &str, body: &str) -> Option<Self> {
        let body: SignalBody = serde_json::from_str(body).ok()?;
        match msg_type {
            MSG_TYPE_OFFER => Some(Self::Offer { call_id: body.call_id, sdp: body.sdp? }),
            MSG_TYPE_ANSWER => Some(Self::Answer { call_id: body.call_id, sdp: body.sdp? }),
            MSG_TYPE_CANDIDATES => Some(Self::Candidates {
                call_id: body.call_id,
                candidates: body.candidates?,
            }),
            MSG_TYPE_HANGUP => Some(Self::Hangup { call_id: body.call_id }),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SignalBody {
    call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidates: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_is_order_independent() {
        let a = Address::new([0x0A; 20]);
        let b = Address::new([0xB0; 20]);
        assert_eq!(call_id(&a, &b), call_id(&b, &a));
        // exactly one side is the caller
        assert_ne!(is_caller(&a, &b), is_caller(&b, &a));
        assert!(is_caller(&a, &b));
    }

    #[test]
    fn test_signal_roundtrip() {
        let signals = [
            PeerSignal::Offer { call_id: "a|b".into(), sdp: "v=0 offer".into() },
            PeerSignal::Answer { call_id: "a|b".into(), sdp: "v=0 answer".into() },
            PeerSignal::Candidates {
                call_id: "a|b".into(),
                candidates: vec!["cand1".into(), "cand2".into()],
            },
            PeerSignal::Hangup { call_id: "a|b".into() },
        ];
        for signal in signals {
            let decoded = PeerSignal::decode(signal.msg_type(), &signal.body()).unwrap();
            assert_eq!(decoded, signal);
        }
    }

    #[test]
    fn test_foreign_event_types_ignored() {
        assert_eq!(PeerSignal::decode("m.text", r#"{"call_id":"a|b"}"#), None);
        assert_eq!(PeerSignal::decode(MSG_TYPE_OFFER, "not json"), None);
        // an offer without sdp is malformed
        assert_eq!(PeerSignal::decode(MSG_TYPE_OFFER, r#"{"call_id":"a|b"}"#), None);
    }
}
