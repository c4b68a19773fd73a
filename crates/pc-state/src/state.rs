//! # Engine State Model
//!
//! The single serializable state tree. Only reducers mutate it, only in
//! response to actions, so any state is reproducible from the action log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shared_bus::Action;
use shared_types::{
    Address, BlockNumber, ChannelKey, PartialEngineConfig, SignedIou, TokenAmount,
    TransportCredentials, U256,
};

/// Lifecycle state of a payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Open transaction sent, channel not yet usable.
    Opening,
    /// Usable for deposits, withdrawals and transfers.
    Open,
    /// Close observed or requested; no new transfers.
    Closing,
    /// Close confirmed on-chain; settle timeout running.
    Closed,
    /// Settle timeout elapsed; settle may be requested.
    Settleable,
    /// Settle observed or requested; removal pending confirmation.
    Settling,
}

impl ChannelState {
    /// Whether the channel can carry new transfers.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        *self == Self::Open
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Settleable => "settleable",
            Self::Settling => "settling",
        };
        f.write_str(name)
    }
}

/// One participant's on-chain totals inside a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnd {
    pub deposit: TokenAmount,
    pub withdraw: TokenAmount,
}

/// A channel with one partner on one token network.
///
/// `id`, `settle_timeout` and `open_block` are unknown while the channel is
/// still `Opening`; a confirmed open replaces the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub state: ChannelState,
    pub id: Option<u64>,
    pub settle_timeout: Option<u64>,
    pub is_first_participant: bool,
    pub open_block: Option<BlockNumber>,
    pub close_block: Option<BlockNumber>,
    /// Which participant sent the close transaction.
    pub close_participant: Option<Address>,
    pub own: ChannelEnd,
    pub partner: ChannelEnd,
}

impl Channel {
    /// A fresh channel in `Opening` state.
    #[must_use]
    pub fn opening() -> Self {
        Self {
            state: ChannelState::Opening,
            id: None,
            settle_timeout: None,
            is_first_participant: false,
            open_block: None,
            close_block: None,
            close_participant: None,
            own: ChannelEnd::default(),
            partner: ChannelEnd::default(),
        }
    }

    /// Total capacity locked on-chain by both sides.
    #[must_use]
    pub fn total_deposit(&self) -> TokenAmount {
        self.own.deposit + self.partner.deposit
    }
}

/// Transport session slice: which server we are logged into, with which
/// credentials, and the per-peer room queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportState {
    pub server: Option<String>,
    pub credentials: Option<TransportCredentials>,
    /// Per-peer room ids, most recently joined first.
    pub rooms: BTreeMap<Address, Vec<String>>,
}

/// The complete engine state tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// Our own account address.
    pub address: Address,
    /// Chain id of the anchoring chain.
    pub chain_id: U256,
    /// Latest observed block number.
    pub block_number: BlockNumber,
    /// Monitored token to token network mapping.
    pub tokens: BTreeMap<Address, Address>,
    /// All known channels, keyed by token network and partner.
    #[serde(with = "channel_map")]
    pub channels: BTreeMap<ChannelKey, Channel>,
    /// Settled channels, kept for history and dispute evidence, keyed by
    /// [`EngineState::old_channel_key`].
    #[serde(default)]
    pub old_channels: BTreeMap<String, Channel>,
    /// Observed but not yet final on-chain events, replayed after restart so
    /// confirmation tracking survives a crash.
    pub pending_txs: Vec<Action>,
    pub transport: TransportState,
    /// Outstanding service IOUs, keyed token network then service address.
    pub ious: BTreeMap<Address, BTreeMap<Address, SignedIou>>,
    /// User configuration overlay.
    pub config: PartialEngineConfig,
}

impl EngineState {
    /// Initial state for a fresh account on a chain.
    #[must_use]
    pub fn new(address: Address, chain_id: U256) -> Self {
        Self {
            address,
            chain_id,
            block_number: 0,
            tokens: BTreeMap::new(),
            channels: BTreeMap::new(),
            old_channels: BTreeMap::new(),
            pending_txs: Vec::new(),
            transport: TransportState::default(),
            ious: BTreeMap::new(),
            config: PartialEngineConfig::default(),
        }
    }

    /// The channel for `key`, if any.
    #[must_use]
    pub fn channel(&self, key: &ChannelKey) -> Option<&Channel> {
        self.channels.get(key)
    }

    /// The token network monitoring `token`, if any.
    #[must_use]
    pub fn token_network(&self, token: &Address) -> Option<Address> {
        self.tokens.get(token).copied()
    }

    /// Archive key for a settled channel. The on-chain id disambiguates
    /// successive channels with the same partner on the same token network.
    #[must_use]
    pub fn old_channel_key(meta: &ChannelKey, id: u64) -> String {
        format!("{meta}#{id}")
    }

    /// A settled channel from the history archive, if any.
    #[must_use]
    pub fn old_channel(&self, meta: &ChannelKey, id: u64) -> Option<&Channel> {
        self.old_channels.get(&Self::old_channel_key(meta, id))
    }
}

/// Serializes the channels map with string keys; struct keys are not
/// representable in JSON maps.
mod channel_map {
    use std::collections::BTreeMap;

    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use shared_types::ChannelKey;

    use super::Channel;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ChannelKey, Channel>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, channel) in map {
            out.serialize_entry(&key.to_string(), channel)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ChannelKey, Channel>, D::Error> {
        let raw = BTreeMap::<String, Channel>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, channel)| {
                let key: ChannelKey = key.parse().map_err(serde::de::Error::custom)?;
                Ok((key, channel))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = EngineState::new(Address::new([0x01; 20]), U256::from(5));
        state.block_number = 100;
        state.tokens.insert(Address::new([0x02; 20]), Address::new([0x03; 20]));
        state.channels.insert(
            ChannelKey {
                token_network: Address::new([0x03; 20]),
                partner: Address::new([0x04; 20]),
            },
            Channel::opening(),
        );

        let json = serde_json::to_string(&state).unwrap();
        // channels are keyed by struct; JSON maps only take string keys
        assert!(json.contains(&format!(
            "\"{}\"",
            ChannelKey {
                token_network: Address::new([0x03; 20]),
                partner: Address::new([0x04; 20]),
            }
        )));
        let back: EngineState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_state_without_archive_field_still_loads() {
        let state = EngineState::new(Address::new([0x01; 20]), U256::from(5));
        let mut json: serde_json::Value = serde_json::to_value(&state).unwrap();
        json.as_object_mut().unwrap().remove("old_channels");
        let back: EngineState = serde_json::from_value(json).unwrap();
        assert!(back.old_channels.is_empty());
    }

    #[test]
    fn test_only_open_is_usable() {
        assert!(ChannelState::Open.is_usable());
        for state in [
            ChannelState::Opening,
            ChannelState::Closing,
            ChannelState::Closed,
            ChannelState::Settleable,
            ChannelState::Settling,
        ] {
            assert!(!state.is_usable());
        }
    }
}
