//! # In-Memory Port Doubles
//!
//! Backend-free implementations of the dependency ports, used by the test
//! suite and handy for embedding the engine without real infrastructure.
//! The chain double keeps an inclusion map so reorgs can be simulated by
//! dropping a transaction from it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pc_channels::{ChainClient, OpenOutcome, TxOutcome};
use pc_signaling::{PeerConnection, PeerConnector};
use pc_transport::{
    server_name, TransportClient, TransportEvent, TransportFactory, TurnServers, UserInfo,
    UserPresence,
};
use shared_types::{
    Address, BlockNumber, EngineError, Hash, TokenAmount, TransportCredentials,
};
use tokio::sync::{broadcast, watch};

/// Chain double: transactions are "included" at the current block and stay
/// included until reorged out.
#[derive(Default)]
pub struct MemoryChain {
    block: AtomicU64,
    next_channel_id: AtomicU64,
    tx_counter: AtomicU64,
    included: Mutex<HashMap<Hash, BlockNumber>>,
}

impl MemoryChain {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_channel_id: AtomicU64::new(1),
            ..Default::default()
        })
    }

    pub fn set_block(&self, block: BlockNumber) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub fn advance(&self, blocks: u64) -> BlockNumber {
        self.block.fetch_add(blocks, Ordering::SeqCst) + blocks
    }

    /// Drop a transaction from the chain, as a reorg would.
    pub fn reorg_out(&self, tx_hash: Hash) {
        self.included.lock().remove(&tx_hash);
    }

    fn submit(&self) -> TxOutcome {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let block = self.block.load(Ordering::SeqCst);
        let tx_hash = Hash::keccak(&n.to_be_bytes());
        self.included.lock().insert(tx_hash, block);
        TxOutcome { tx_hash, block }
    }
}

#[async_trait]
impl ChainClient for MemoryChain {
    async fn block_number(&self) -> Result<BlockNumber, EngineError> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn open_channel(
        &self,
        _token_network: Address,
        _partner: Address,
        _settle_timeout: u64,
    ) -> Result<OpenOutcome, EngineError> {
        Ok(OpenOutcome {
            tx: self.submit(),
            id: self.next_channel_id.fetch_add(1, Ordering::SeqCst),
            is_first_participant: true,
        })
    }

    async fn set_total_deposit(
        &self,
        _token_network: Address,
        _channel_id: u64,
        _partner: Address,
        _total_deposit: TokenAmount,
    ) -> Result<TxOutcome, EngineError> {
        Ok(self.submit())
    }

    async fn close_channel(
        &self,
        _token_network: Address,
        _channel_id: u64,
        _partner: Address,
    ) -> Result<TxOutcome, EngineError> {
        Ok(self.submit())
    }

    async fn settle_channel(
        &self,
        _token_network: Address,
        _channel_id: u64,
        _partner: Address,
    ) -> Result<TxOutcome, EngineError> {
        Ok(self.submit())
    }

    async fn transaction_block(&self, tx_hash: Hash) -> Result<Option<BlockNumber>, EngineError> {
        Ok(self.included.lock().get(&tx_hash).copied())
    }
}

/// Transport double: one server, instant probes, a seedable user directory
/// and always-successful sends.
pub struct MemoryTransport {
    server: String,
    directory: Mutex<Vec<UserInfo>>,
    clients: Mutex<Vec<Arc<MemoryTransportClient>>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new(server: &str) -> Arc<Self> {
        Arc::new(Self {
            server: server.to_string(),
            directory: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        })
    }

    /// Seed a user other sessions can discover.
    pub fn add_user(&self, user: UserInfo) {
        self.directory.lock().push(user);
        for client in self.clients.lock().iter() {
            *client.directory.lock() = self.directory.lock().clone();
        }
    }

    /// The session most recently handed out, for inspection and for pushing
    /// inbound events.
    #[must_use]
    pub fn client(&self) -> Option<Arc<MemoryTransportClient>> {
        self.clients.lock().last().cloned()
    }

    fn session(&self, user_id: String) -> Arc<MemoryTransportClient> {
        let (events_tx, _) = broadcast::channel(256);
        let client = Arc::new(MemoryTransportClient {
            user_id,
            events_tx,
            directory: Mutex::new(self.directory.lock().clone()),
            sent: Mutex::new(Vec::new()),
            rooms_opened: AtomicU64::new(0),
        });
        self.clients.lock().push(client.clone());
        client
    }
}

#[async_trait]
impl TransportFactory for MemoryTransport {
    async fn fetch_server_list(&self, _lookup_url: &str) -> Result<Vec<String>, EngineError> {
        Ok(vec![self.server.clone()])
    }

    async fn probe(&self, _server: &str) -> Result<Duration, EngineError> {
        Ok(Duration::from_millis(1))
    }

    async fn login(
        &self,
        _server: &str,
        credentials: &TransportCredentials,
    ) -> Result<Arc<dyn TransportClient>, EngineError> {
        Ok(self.session(credentials.user_id.clone()))
    }

    async fn register(
        &self,
        server: &str,
        username: &str,
        _password: &str,
    ) -> Result<Arc<dyn TransportClient>, EngineError> {
        let user_id = format!("@{username}:{}", server_name(server));
        Ok(self.session(user_id))
    }
}

pub struct MemoryTransportClient {
    user_id: String,
    events_tx: broadcast::Sender<TransportEvent>,
    directory: Mutex<Vec<UserInfo>>,
    /// Every event sent through this session, `(room, type, body)`.
    pub sent: Mutex<Vec<(String, String, String)>>,
    rooms_opened: AtomicU64,
}

impl MemoryTransportClient {
    /// Inject an inbound event, as the server sync would.
    pub fn push(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl TransportClient for MemoryTransportClient {
    fn user_id(&self) -> String {
        self.user_id.clone()
    }

    fn device_id(&self) -> String {
        "MEMORY".to_string()
    }

    fn access_token(&self) -> String {
        "memory-token".to_string()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn set_display_name(&self, _name: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_capabilities(&self, _caps: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_presence(&self, _available: bool) -> Result<(), EngineError> {
        Ok(())
    }

    async fn search_users(&self, localpart: &str) -> Result<Vec<UserInfo>, EngineError> {
        Ok(self
            .directory
            .lock()
            .iter()
            .filter(|user| user.user_id.contains(localpart))
            .cloned()
            .collect())
    }

    async fn track_presence(&self, _user_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn presence_status(&self, _user_id: &str) -> Result<UserPresence, EngineError> {
        Ok(UserPresence { available: true, ts: 0 })
    }

    async fn open_room(&self, _user_id: &str) -> Result<String, EngineError> {
        let n = self.rooms_opened.fetch_add(1, Ordering::SeqCst);
        Ok(format!("!direct{n}:memory"))
    }

    async fn join_room(&self, _room_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn leave_room(&self, _room_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn send(&self, room_id: &str, msg_type: &str, body: &str) -> Result<(), EngineError> {
        self.sent
            .lock()
            .push((room_id.to_string(), msg_type.to_string(), body.to_string()));
        Ok(())
    }

    async fn turn_servers(&self) -> Result<TurnServers, EngineError> {
        Ok(TurnServers::default())
    }

    async fn logout(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Peer connection double: channels open as soon as both descriptions are
/// applied, sends are recorded, inbound traffic is injected by tests.
pub struct MemoryPeerConnection {
    pub remote: Mutex<Vec<(String, String)>>,
    pub candidates: Mutex<Vec<String>>,
    local_tx: broadcast::Sender<String>,
    open_tx: watch::Sender<bool>,
    open_rx: watch::Receiver<bool>,
    incoming_tx: broadcast::Sender<String>,
    pub sent: Mutex<Vec<String>>,
}

impl MemoryPeerConnection {
    fn new() -> Arc<Self> {
        let (local_tx, _) = broadcast::channel(16);
        let (incoming_tx, _) = broadcast::channel(16);
        let (open_tx, open_rx) = watch::channel(false);
        Arc::new(Self {
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            local_tx,
            open_tx,
            open_rx,
            incoming_tx,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn push_incoming(&self, text: &str) {
        let _ = self.incoming_tx.send(text.to_string());
    }

    pub fn discover_candidate(&self, candidate: &str) {
        let _ = self.local_tx.send(candidate.to_string());
    }
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    async fn create_offer(&self) -> Result<String, EngineError> {
        Ok("memory-offer".to_string())
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        let _ = self.open_tx.send(true);
        Ok("memory-answer".to_string())
    }

    async fn set_remote_description(&self, sdp_type: &str, sdp: &str) -> Result<(), EngineError> {
        self.remote.lock().push((sdp_type.to_string(), sdp.to_string()));
        if sdp_type == "answer" {
            let _ = self.open_tx.send(true);
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str) -> Result<(), EngineError> {
        self.candidates.lock().push(candidate.to_string());
        Ok(())
    }

    fn local_candidates(&self) -> broadcast::Receiver<String> {
        self.local_tx.subscribe()
    }

    async fn wait_open(&self) -> Result<(), EngineError> {
        let mut rx = self.open_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return Err(EngineError::Transport("connection dropped".to_string()));
            }
        }
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<String> {
        self.incoming_tx.subscribe()
    }

    async fn send(&self, text: &str) -> Result<(), EngineError> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct MemoryConnector {
    pub connections: Mutex<Vec<Arc<MemoryPeerConnection>>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(&self, _turn: &TurnServers) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let conn = MemoryPeerConnection::new();
        self.connections.lock().push(conn.clone());
        Ok(conn)
    }
}
