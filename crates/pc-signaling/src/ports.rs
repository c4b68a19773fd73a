//! # Peer Connection Ports
//!
//! Contracts against the underlying peer-to-peer stack. A connection is one
//! negotiation attempt: descriptions go in, discovered candidates and data
//! channel traffic come out on broadcast channels.

use std::sync::Arc;

use async_trait::async_trait;
use pc_transport::TurnServers;
use shared_types::EngineError;
use tokio::sync::broadcast;

/// Port for creating fresh peer connections, one per negotiation attempt.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, turn: &TurnServers) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

/// One peer connection carrying a single data channel.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce the local offer description (caller side).
    async fn create_offer(&self) -> Result<String, EngineError>;

    /// Produce the local answer description (callee side, after the remote
    /// offer was applied).
    async fn create_answer(&self) -> Result<String, EngineError>;

    /// Apply the remote description; `sdp_type` is `offer` or `answer`.
    async fn set_remote_description(&self, sdp_type: &str, sdp: &str) -> Result<(), EngineError>;

    /// Apply one remote connectivity candidate.
    async fn add_candidate(&self, candidate: &str) -> Result<(), EngineError>;

    /// Locally discovered connectivity candidates, to be relayed to the peer.
    fn local_candidates(&self) -> broadcast::Receiver<String>;

    /// Resolves once the data channel reports open. Safe to poll repeatedly;
    /// resolves immediately if the channel is already open.
    async fn wait_open(&self) -> Result<(), EngineError>;

    /// Messages received over the data channel. A closed stream means the
    /// connection is gone.
    fn incoming(&self) -> broadcast::Receiver<String>;

    /// Send one message over the data channel.
    async fn send(&self, text: &str) -> Result<(), EngineError>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}
