//! # Action Taxonomy
//!
//! All actions that can flow through the bus. Confirmable variants carry a
//! [`Confirmation`] whose `confirmed` tri-state reflects on-chain finality:
//! `None` means observed but not yet final, `Some(true)` means final (apply),
//! `Some(false)` means the observed event was reverted by a reorg (discard).

use serde::{Deserialize, Serialize};
use shared_types::{
    Address, Caps, ChannelKey, EngineError, Hash, PartialEngineConfig, ShutdownReason, SignedIou,
    TokenAmount, TransportCredentials,
};

/// Identifier correlating retriable off-chain messages and transfers.
pub type MessageId = u64;

/// On-chain observation metadata carried by every confirmable action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub tx_hash: Hash,
    pub tx_block: u64,
    /// `None` = pending, `Some(true)` = final, `Some(false)` = reverted.
    pub confirmed: Option<bool>,
}

/// All events that can be published to the action bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    // =========================================================================
    // CHAIN OBSERVATIONS
    // =========================================================================
    /// A new head was detected by the chain client.
    NewBlock { block_number: u64 },

    /// A token network deployment is now monitored for `token`.
    TokenMonitored {
        token: Address,
        token_network: Address,
        from_block: Option<u64>,
    },

    // =========================================================================
    // CHANNEL LIFECYCLE (meta = ChannelKey)
    // =========================================================================
    /// Request a channel to be opened with `meta` partner.
    ChannelOpenRequest {
        meta: ChannelKey,
        settle_timeout: u64,
    },
    /// A channel open event was observed on-chain.
    ChannelOpenSuccess {
        meta: ChannelKey,
        id: u64,
        settle_timeout: u64,
        is_first_participant: bool,
        confirmation: Confirmation,
    },
    ChannelOpenFailure {
        meta: ChannelKey,
        error: EngineError,
    },

    ChannelDepositRequest {
        meta: ChannelKey,
        deposit: TokenAmount,
    },
    /// A deposit event was observed on-chain; `total_deposit` replaces the
    /// participant's previous total.
    ChannelDepositSuccess {
        meta: ChannelKey,
        id: u64,
        participant: Address,
        total_deposit: TokenAmount,
        confirmation: Confirmation,
    },
    ChannelDepositFailure {
        meta: ChannelKey,
        error: EngineError,
    },

    /// A withdraw event was observed on-chain.
    ChannelWithdrawn {
        meta: ChannelKey,
        id: u64,
        participant: Address,
        total_withdraw: TokenAmount,
        confirmation: Confirmation,
    },

    ChannelCloseRequest {
        meta: ChannelKey,
    },
    ChannelCloseSuccess {
        meta: ChannelKey,
        id: u64,
        participant: Address,
        confirmation: Confirmation,
    },
    ChannelCloseFailure {
        meta: ChannelKey,
        error: EngineError,
    },

    /// The settle timeout elapsed since close; emitted by the channel
    /// watcher, never computed inside reducers.
    ChannelSettleable {
        meta: ChannelKey,
        settleable_block: u64,
    },
    ChannelSettleRequest {
        meta: ChannelKey,
    },
    ChannelSettleSuccess {
        meta: ChannelKey,
        id: u64,
        confirmation: Confirmation,
    },
    ChannelSettleFailure {
        meta: ChannelKey,
        error: EngineError,
    },

    // =========================================================================
    // TRANSPORT SESSION (meta = peer address where present)
    // =========================================================================
    /// The transport session is authenticated against `server` with
    /// `credentials` (persisted for the next run).
    TransportSetup {
        server: String,
        credentials: TransportCredentials,
    },

    /// Request presence monitoring for `address`.
    PresenceRequest { address: Address },
    /// Monitored peer presence changed. First update for an address doubles
    /// as the success of `PresenceRequest`.
    PresenceUpdate {
        address: Address,
        user_id: String,
        available: bool,
        ts: u64,
        caps: Option<Caps>,
    },
    PresenceFailure {
        address: Address,
        error: EngineError,
    },

    /// `room_id` goes to the front of `address`'s room queue.
    RoomJoined { address: Address, room_id: String },
    /// `room_id` is dropped from `address`'s room queue.
    RoomLeft { address: Address, room_id: String },

    // =========================================================================
    // MESSAGING
    // =========================================================================
    /// Queue `text` for delivery to `address` (retried until acknowledged).
    MessageSend {
        address: Address,
        message_id: MessageId,
        text: String,
    },
    /// `message_id` was delivered to `address`.
    MessageSent {
        address: Address,
        message_id: MessageId,
    },
    /// A message arrived from `address` over any transport.
    MessageReceived {
        address: Address,
        text: String,
        ts: u64,
        user_id: Option<String>,
    },

    // =========================================================================
    // PEER DATA-CHANNEL SESSIONS (meta = peer address)
    // =========================================================================
    /// A direct data channel to `address` is live and preferred for sends.
    PeerSessionActive { address: Address, call_id: String },
    /// No direct data channel to `address` (closed, failed or hung up).
    PeerSessionInactive { address: Address },

    // =========================================================================
    // TRANSFERS (owned by a collaborator subsystem; the core tracks pending)
    // =========================================================================
    TransferRequest {
        transfer_id: MessageId,
        token: Address,
        target: Address,
        amount: TokenAmount,
        secrethash: Hash,
    },
    TransferSuccess {
        transfer_id: MessageId,
    },
    TransferFailure {
        transfer_id: MessageId,
        error: EngineError,
    },

    // =========================================================================
    // SERVICES
    // =========================================================================
    /// A signed IOU for `service` on `token_network` was issued/updated.
    IouStored {
        token_network: Address,
        service: Address,
        iou: SignedIou,
    },
    /// The IOU for `service` on `token_network` was claimed or expired.
    IouCleared {
        token_network: Address,
        service: Address,
    },

    // =========================================================================
    // CONFIG & LIFECYCLE
    // =========================================================================
    ConfigUpdate {
        config: PartialEngineConfig,
    },
    /// Terminal event of the stream; everything winds down after this.
    Shutdown {
        reason: ShutdownReason,
    },
}

impl Action {
    /// Topic for subscription filtering.
    #[must_use]
    pub fn topic(&self) -> ActionTopic {
        match self {
            Self::NewBlock { .. } | Self::TokenMonitored { .. } => ActionTopic::Chain,
            Self::ChannelOpenRequest { .. }
            | Self::ChannelOpenSuccess { .. }
            | Self::ChannelOpenFailure { .. }
            | Self::ChannelDepositRequest { .. }
            | Self::ChannelDepositSuccess { .. }
            | Self::ChannelDepositFailure { .. }
            | Self::ChannelWithdrawn { .. }
            | Self::ChannelCloseRequest { .. }
            | Self::ChannelCloseSuccess { .. }
            | Self::ChannelCloseFailure { .. }
            | Self::ChannelSettleable { .. }
            | Self::ChannelSettleRequest { .. }
            | Self::ChannelSettleSuccess { .. }
            | Self::ChannelSettleFailure { .. } => ActionTopic::Channels,
            Self::TransportSetup { .. }
            | Self::PresenceRequest { .. }
            | Self::PresenceUpdate { .. }
            | Self::PresenceFailure { .. }
            | Self::RoomJoined { .. }
            | Self::RoomLeft { .. } => ActionTopic::Transport,
            Self::MessageSend { .. } | Self::MessageSent { .. } | Self::MessageReceived { .. } => {
                ActionTopic::Messages
            }
            Self::PeerSessionActive { .. } | Self::PeerSessionInactive { .. } => {
                ActionTopic::PeerSession
            }
            Self::TransferRequest { .. }
            | Self::TransferSuccess { .. }
            | Self::TransferFailure { .. } => ActionTopic::Transfers,
            Self::IouStored { .. } | Self::IouCleared { .. } => ActionTopic::Services,
            Self::ConfigUpdate { .. } => ActionTopic::Config,
            Self::Shutdown { .. } => ActionTopic::Shutdown,
        }
    }

    /// The channel this action is about, when it carries one.
    #[must_use]
    pub fn channel_key(&self) -> Option<ChannelKey> {
        match self {
            Self::ChannelOpenRequest { meta, .. }
            | Self::ChannelOpenSuccess { meta, .. }
            | Self::ChannelOpenFailure { meta, .. }
            | Self::ChannelDepositRequest { meta, .. }
            | Self::ChannelDepositSuccess { meta, .. }
            | Self::ChannelDepositFailure { meta, .. }
            | Self::ChannelWithdrawn { meta, .. }
            | Self::ChannelCloseRequest { meta }
            | Self::ChannelCloseSuccess { meta, .. }
            | Self::ChannelCloseFailure { meta, .. }
            | Self::ChannelSettleable { meta, .. }
            | Self::ChannelSettleRequest { meta }
            | Self::ChannelSettleSuccess { meta, .. }
            | Self::ChannelSettleFailure { meta, .. } => Some(*meta),
            _ => None,
        }
    }

    /// The peer address this action is about, when it carries one.
    #[must_use]
    pub fn peer_address(&self) -> Option<Address> {
        match self {
            Self::PresenceRequest { address }
            | Self::PresenceUpdate { address, .. }
            | Self::PresenceFailure { address, .. }
            | Self::RoomJoined { address, .. }
            | Self::RoomLeft { address, .. }
            | Self::MessageSend { address, .. }
            | Self::MessageSent { address, .. }
            | Self::MessageReceived { address, .. }
            | Self::PeerSessionActive { address, .. }
            | Self::PeerSessionInactive { address } => Some(*address),
            _ => None,
        }
    }

    /// Confirmation metadata, for confirmable on-chain observations.
    #[must_use]
    pub fn confirmation(&self) -> Option<&Confirmation> {
        match self {
            Self::ChannelOpenSuccess { confirmation, .. }
            | Self::ChannelDepositSuccess { confirmation, .. }
            | Self::ChannelWithdrawn { confirmation, .. }
            | Self::ChannelCloseSuccess { confirmation, .. }
            | Self::ChannelSettleSuccess { confirmation, .. } => Some(confirmation),
            _ => None,
        }
    }

    /// Copy of this action with its confirmed tri-state replaced. Used by
    /// the confirmation epic to re-emit a pending observation as final or
    /// reverted. Returns `None` for non-confirmable actions.
    #[must_use]
    pub fn with_confirmed(&self, confirmed: Option<bool>) -> Option<Self> {
        let mut out = self.clone();
        match &mut out {
            Self::ChannelOpenSuccess { confirmation, .. }
            | Self::ChannelDepositSuccess { confirmation, .. }
            | Self::ChannelWithdrawn { confirmation, .. }
            | Self::ChannelCloseSuccess { confirmation, .. }
            | Self::ChannelSettleSuccess { confirmation, .. } => {
                confirmation.confirmed = confirmed;
                Some(out)
            }
            _ => None,
        }
    }

    /// Whether this is a failure member of a request/success/failure triple.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ChannelOpenFailure { .. }
                | Self::ChannelDepositFailure { .. }
                | Self::ChannelCloseFailure { .. }
                | Self::ChannelSettleFailure { .. }
                | Self::PresenceFailure { .. }
                | Self::TransferFailure { .. }
        )
    }
}

/// Action topics for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionTopic {
    Chain,
    Channels,
    Transport,
    Messages,
    PeerSession,
    Transfers,
    Services,
    Config,
    Shutdown,
    /// All actions (no filtering).
    All,
}

/// Filter for subscribing to specific actions.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    /// Topics to include. Empty means all topics.
    pub topics: Vec<ActionTopic>,
    /// Restrict to actions about this channel.
    pub channel: Option<ChannelKey>,
    /// Restrict to actions about this peer address.
    pub peer: Option<Address>,
}

impl ActionFilter {
    /// A filter that accepts every action.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter for specific topics. The shutdown topic is always included
    /// so no subscriber can miss the terminal action.
    #[must_use]
    pub fn topics(topics: Vec<ActionTopic>) -> Self {
        Self {
            topics,
            ..Self::default()
        }
    }

    /// Restrict to one channel's actions.
    #[must_use]
    pub fn channel(mut self, key: ChannelKey) -> Self {
        self.channel = Some(key);
        self
    }

    /// Restrict to one peer's actions.
    #[must_use]
    pub fn peer(mut self, address: Address) -> Self {
        self.peer = Some(address);
        self
    }

    /// Check whether an action matches this filter.
    #[must_use]
    pub fn matches(&self, action: &Action) -> bool {
        // the terminal action is always delivered
        if matches!(action, Action::Shutdown { .. }) {
            return true;
        }
        let topic_match = self.topics.is_empty()
            || self.topics.contains(&ActionTopic::All)
            || self.topics.contains(&action.topic());
        let channel_match = match self.channel {
            Some(key) => action.channel_key() == Some(key),
            None => true,
        };
        let peer_match = match self.peer {
            Some(address) => action.peer_address() == Some(address),
            None => true,
        };
        topic_match && channel_match && peer_match
    }
}
