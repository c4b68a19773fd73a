//! # Transport Ports
//!
//! Contracts against the federated messaging layer. A [`TransportFactory`]
//! discovers and authenticates against servers; the resulting
//! [`TransportClient`] is one logged-in session. Inbound traffic arrives as
//! [`TransportEvent`]s on a broadcast channel so several epics can follow
//! the same session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{EngineError, TransportCredentials};
use tokio::sync::broadcast;

/// A user found in the server's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: String,
    /// Profile display name; ours carry an identity signature.
    pub display_name: Option<String>,
    /// Advertised capability string, if the user published one.
    pub capabilities: Option<String>,
}

/// A user's presence as the server currently records it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserPresence {
    pub available: bool,
    /// Server timestamp of the last presence change, 0 if never seen.
    pub ts: u64,
}

/// Relay/STUN endpoints handed out by the transport server for peer
/// connection setup, with an optional credential lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnServers {
    pub uris: Vec<String>,
    pub username: String,
    pub password: String,
    pub ttl_secs: Option<u64>,
}

/// Inbound traffic from the logged-in session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A tracked user's presence changed.
    Presence {
        user_id: String,
        available: bool,
        ts: u64,
    },
    /// A message arrived in a room we are part of.
    Message {
        room_id: String,
        sender: String,
        /// Event type, e.g. `m.text` or the `m.call.*` signaling family.
        msg_type: String,
        body: String,
        ts: u64,
    },
    /// We were invited into a room.
    Invite { room_id: String, sender: String },
}

/// Port for discovering and authenticating against transport servers.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Fetch the published list of candidate server URLs.
    async fn fetch_server_list(&self, lookup_url: &str) -> Result<Vec<String>, EngineError>;

    /// Round-trip-time probe of one server.
    async fn probe(&self, server: &str) -> Result<Duration, EngineError>;

    /// Log in with previously issued credentials.
    async fn login(
        &self,
        server: &str,
        credentials: &TransportCredentials,
    ) -> Result<Arc<dyn TransportClient>, EngineError>;

    /// First-time registration; the password is a signature over the server
    /// name so the account provably belongs to our address.
    async fn register(
        &self,
        server: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn TransportClient>, EngineError>;
}

/// One authenticated session against a transport server.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Fully-qualified user id of this session, `@<localpart>:<server>`.
    fn user_id(&self) -> String;

    fn device_id(&self) -> String;

    fn access_token(&self) -> String;

    /// Subscribe to inbound traffic.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    async fn set_display_name(&self, name: &str) -> Result<(), EngineError>;

    /// Publish our capability string for peers to read.
    async fn set_capabilities(&self, caps: &str) -> Result<(), EngineError>;

    /// Flip our own availability; `false` is the best-effort offline signal
    /// sent on clean shutdown.
    async fn set_presence(&self, available: bool) -> Result<(), EngineError>;

    /// Look up candidate users for an address localpart across federation.
    async fn search_users(&self, localpart: &str) -> Result<Vec<UserInfo>, EngineError>;

    /// Start receiving presence events for `user_id`.
    async fn track_presence(&self, user_id: &str) -> Result<(), EngineError>;

    /// Current presence of `user_id`.
    async fn presence_status(&self, user_id: &str) -> Result<UserPresence, EngineError>;

    /// Open (or join) a direct room with `user_id`; returns the room id.
    async fn open_room(&self, user_id: &str) -> Result<String, EngineError>;

    async fn join_room(&self, room_id: &str) -> Result<(), EngineError>;

    async fn leave_room(&self, room_id: &str) -> Result<(), EngineError>;

    /// Send one event of `msg_type` with `body` into a room.
    async fn send(&self, room_id: &str, msg_type: &str, body: &str) -> Result<(), EngineError>;

    /// Fetch relay credentials for peer connection setup.
    async fn turn_servers(&self) -> Result<TurnServers, EngineError>;

    /// Log out, invalidating the session server-side.
    async fn logout(&self) -> Result<(), EngineError>;
}

/// Shared handle to the current transport session.
///
/// Set exactly once by the init epic; other epics wait for the setup action
/// and then read it.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<RwLock<Option<Arc<dyn TransportClient>>>>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, client: Arc<dyn TransportClient>) {
        *self.inner.write() = Some(client);
    }

    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn TransportClient>> {
        self.inner.read().clone()
    }

    /// The session, or a transport error for epics that require one.
    pub fn require(&self) -> Result<Arc<dyn TransportClient>, EngineError> {
        self.get()
            .ok_or_else(|| EngineError::Transport("no transport session".to_string()))
    }
}
