//! # Engine Facade
//!
//! Wires the store, the epics and the persistence task into one running
//! engine and exposes an imperative API over the action stream: each call
//! subscribes for the outcome before dispatching its request, so responses
//! cannot be missed regardless of scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use pc_channels::{
    BlockPollEpic, ChainClient, ChannelCloseEpic, ChannelDepositEpic, ChannelOpenEpic,
    ChannelSettleEpic, ConfirmationEpic, SettleableWatchEpic,
};
use pc_engine::EpicEngine;
use pc_signaling::{PeerConnector, WebRtcEpic};
use pc_state::{spawn_persistence, EngineState, StateStore, Storage};
use pc_transport::{MessagingEpic, PresenceEpic, Session, TransportFactory, TransportInitEpic};
use shared_bus::{Action, ActionBus, ActionFilter, ActionTopic, Subscription};
use shared_crypto::Signer;
use shared_types::{
    Address, ChannelKey, EngineConfig, EngineError, Hash, PartialEngineConfig, Secret,
    ShutdownReason, TokenAmount, U256,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::ids::next_id;
use crate::logging::{init_logging, LogHandle};
use crate::transfers::TransferEpic;

/// One bus subscription each: the supervisor, the derived-state task and
/// the twelve epics. Startup waits until all of them are listening.
const STARTUP_SUBSCRIPTIONS: usize = 14;

/// Everything the engine needs to run: the signing identity, the backend
/// ports and the configuration overlay applied on top of the defaults.
pub struct EngineOptions {
    pub signer: Arc<dyn Signer>,
    pub chain: Arc<dyn ChainClient>,
    pub transport: Arc<dyn TransportFactory>,
    pub connector: Arc<dyn PeerConnector>,
    pub storage: Arc<dyn Storage>,
    pub chain_id: U256,
    pub config: PartialEngineConfig,
}

/// Optional knobs for [`Engine::transfer`].
#[derive(Default)]
pub struct TransferOptions {
    /// Secret to lock the transfer on. Generated when absent.
    pub secret: Option<Secret>,
    /// Hash to lock on when the secret is kept elsewhere. When both are
    /// given they must match.
    pub secret_hash: Option<Hash>,
}

/// Result of a presence lookup.
#[derive(Debug, Clone)]
pub struct Availability {
    pub user_id: String,
    pub available: bool,
    pub ts: u64,
}

/// A running engine instance.
pub struct Engine {
    store: Arc<StateStore>,
    engine: JoinHandle<ShutdownReason>,
    persist: JoinHandle<()>,
    stop_persist: watch::Sender<bool>,
}

impl Engine {
    /// Boot the engine: restore persisted state, spawn every epic and wait
    /// until all of them are subscribed to the action stream.
    ///
    /// Fails when the persisted state belongs to a different account or
    /// chain; wiping the storage is a caller decision, never an implicit one.
    pub async fn start(options: EngineOptions) -> anyhow::Result<Self> {
        let EngineOptions { signer, chain, transport, connector, storage, chain_id, config } =
            options;
        let log = init_logging(config.log_level.as_deref().unwrap_or("info"));

        let address = signer.address();
        let initial = match storage.load().await.context("loading persisted state")? {
            Some(state) => {
                if state.address != address {
                    bail!(
                        "persisted state belongs to {}, signing account is {address}",
                        state.address
                    );
                }
                if state.chain_id != chain_id {
                    bail!(
                        "persisted state is for chain {}, connected to chain {chain_id}",
                        state.chain_id
                    );
                }
                info!(%address, block = state.block_number, "state restored");
                state
            }
            None => EngineState::new(address, chain_id),
        };

        let store = StateStore::new(ActionBus::new(), initial, EngineConfig::default());
        store.dispatch(Action::ConfigUpdate { config });
        if let Some(log) = log {
            spawn_log_level_watcher(log, store.watch_config());
        }

        let (stop_persist, stop_rx) = watch::channel(false);
        let persist = spawn_persistence(
            storage,
            store.watch_state(),
            store.config().persist_debounce(),
            stop_rx,
        );

        let session = Session::new();
        let mut epics = EpicEngine::new(store.clone());
        epics.register(Arc::new(BlockPollEpic::new(chain.clone())));
        epics.register(Arc::new(ChannelOpenEpic::new(chain.clone())));
        epics.register(Arc::new(ChannelDepositEpic::new(chain.clone())));
        epics.register(Arc::new(ChannelCloseEpic::new(chain.clone())));
        epics.register(Arc::new(ChannelSettleEpic::new(chain.clone())));
        epics.register(Arc::new(ConfirmationEpic::new(chain)));
        epics.register(Arc::new(SettleableWatchEpic));
        epics.register(Arc::new(TransportInitEpic::new(
            transport,
            session.clone(),
            signer.clone(),
        )));
        epics.register(Arc::new(PresenceEpic::new(session.clone())));
        epics.register(Arc::new(MessagingEpic::new(session.clone())));
        epics.register(Arc::new(WebRtcEpic::new(session, connector)));
        epics.register(Arc::new(TransferEpic::new(signer)));
        let engine = tokio::spawn(epics.run());

        while store.bus().subscriber_count() < STARTUP_SUBSCRIPTIONS {
            if store.is_shutting_down() {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        // requeue behind any epic task not yet polled to its first await
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        Ok(Self { store, engine, persist, stop_persist })
    }

    /// The signing account this engine runs as.
    #[must_use]
    pub fn address(&self) -> Address {
        self.store.snapshot().address
    }

    /// The underlying store, for observers that want raw state or actions.
    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Start monitoring `token`'s network; channels and transfers on that
    /// token resolve against it from here on.
    pub fn monitor_token(&self, token: &str, token_network: &str) -> Result<(), EngineError> {
        let token: Address = token.parse()?;
        let token_network: Address = token_network.parse()?;
        self.store.dispatch_external(Action::TokenMonitored {
            token,
            token_network,
            from_block: None,
        })
    }

    /// Open a channel with `partner` on `token`'s network. Resolves with the
    /// opening transaction hash once the open event is observed on-chain.
    pub async fn open_channel(
        &self,
        token: &str,
        partner: &str,
        settle_timeout: Option<u64>,
    ) -> Result<Hash, EngineError> {
        let meta = self.channel_key(token, partner)?;
        let sub = self.channel_sub(meta);
        self.store.dispatch_external(Action::ChannelOpenRequest {
            meta,
            settle_timeout: settle_timeout.unwrap_or_else(|| self.store.config().settle_timeout),
        })?;
        channel_outcome(sub, |action| match action {
            Action::ChannelOpenSuccess { confirmation, .. } => Some(Ok(confirmation.tx_hash)),
            Action::ChannelOpenFailure { error, .. } => Some(Err(error)),
            _ => None,
        })
        .await
    }

    /// Raise the on-chain deposit for the channel with `partner`.
    pub async fn deposit_channel(
        &self,
        token: &str,
        partner: &str,
        deposit: TokenAmount,
    ) -> Result<Hash, EngineError> {
        if deposit.is_zero() {
            return Err(EngineError::InvalidAmount("deposit must be positive".to_string()));
        }
        let meta = self.channel_key(token, partner)?;
        let sub = self.channel_sub(meta);
        self.store
            .dispatch_external(Action::ChannelDepositRequest { meta, deposit })?;
        channel_outcome(sub, |action| match action {
            Action::ChannelDepositSuccess { confirmation, .. } => Some(Ok(confirmation.tx_hash)),
            Action::ChannelDepositFailure { error, .. } => Some(Err(error)),
            _ => None,
        })
        .await
    }

    /// Close the channel with `partner`.
    pub async fn close_channel(&self, token: &str, partner: &str) -> Result<Hash, EngineError> {
        let meta = self.channel_key(token, partner)?;
        let sub = self.channel_sub(meta);
        self.store
            .dispatch_external(Action::ChannelCloseRequest { meta })?;
        channel_outcome(sub, |action| match action {
            Action::ChannelCloseSuccess { confirmation, .. } => Some(Ok(confirmation.tx_hash)),
            Action::ChannelCloseFailure { error, .. } => Some(Err(error)),
            _ => None,
        })
        .await
    }

    /// Settle the closed channel with `partner` once its settle timeout has
    /// elapsed.
    pub async fn settle_channel(&self, token: &str, partner: &str) -> Result<Hash, EngineError> {
        let meta = self.channel_key(token, partner)?;
        let sub = self.channel_sub(meta);
        self.store
            .dispatch_external(Action::ChannelSettleRequest { meta })?;
        channel_outcome(sub, |action| match action {
            Action::ChannelSettleSuccess { confirmation, .. } => Some(Ok(confirmation.tx_hash)),
            Action::ChannelSettleFailure { error, .. } => Some(Err(error)),
            _ => None,
        })
        .await
    }

    /// Look up `address` on the transport and start tracking its presence.
    pub async fn get_availability(&self, address: &str) -> Result<Availability, EngineError> {
        let address: Address = address.parse()?;
        let mut sub = self
            .store
            .subscribe(ActionFilter::topics(vec![ActionTopic::Transport]).peer(address));
        self.store
            .dispatch_external(Action::PresenceRequest { address })?;
        let found = timeout(
            self.store.config().http_timeout(),
            sub.find(|action| {
                matches!(
                    action,
                    Action::PresenceUpdate { .. }
                        | Action::PresenceFailure { .. }
                        | Action::Shutdown { .. }
                )
            }),
        )
        .await
        .map_err(|_| EngineError::Timeout("presence lookup".to_string()))?;
        match found {
            Ok(Action::PresenceUpdate { user_id, available, ts, .. }) => {
                Ok(Availability { user_id, available, ts })
            }
            Ok(Action::PresenceFailure { error, .. }) => Err(error),
            Ok(Action::Shutdown { reason }) => Err(EngineError::ShuttingDown(reason)),
            Ok(_) | Err(_) => Err(EngineError::Transport("action stream closed".to_string())),
        }
    }

    /// Send `amount` of `token` to `target` over a direct channel. Resolves
    /// with the secret hash the transfer is locked on once the target
    /// acknowledged the signed transfer message.
    pub async fn transfer(
        &self,
        token: &str,
        target: &str,
        amount: TokenAmount,
        options: TransferOptions,
    ) -> Result<Hash, EngineError> {
        let token: Address = token.parse()?;
        let target: Address = target.parse()?;
        if amount.is_zero() {
            return Err(EngineError::InvalidAmount(
                "transfer amount must be positive".to_string(),
            ));
        }
        let secrethash = match (options.secret, options.secret_hash) {
            (Some(secret), Some(hash)) => {
                if secret.secrethash() != hash {
                    return Err(EngineError::SecretMismatch);
                }
                hash
            }
            (Some(secret), None) => secret.secrethash(),
            (None, Some(hash)) => hash,
            (None, None) => Secret::new(rand::random()).secrethash(),
        };

        let transfer_id = next_id();
        let mut sub = self
            .store
            .subscribe(ActionFilter::topics(vec![ActionTopic::Transfers]));
        self.store.dispatch_external(Action::TransferRequest {
            transfer_id,
            token,
            target,
            amount,
            secrethash,
        })?;
        loop {
            match sub.recv().await {
                Ok(Action::TransferSuccess { transfer_id: id }) if id == transfer_id => {
                    return Ok(secrethash);
                }
                Ok(Action::TransferFailure { transfer_id: id, error }) if id == transfer_id => {
                    return Err(error);
                }
                Ok(Action::Shutdown { reason }) => return Err(EngineError::ShuttingDown(reason)),
                Ok(_) => continue,
                Err(_) => {
                    return Err(EngineError::Transport("action stream closed".to_string()));
                }
            }
        }
    }

    /// Request a graceful stop. Idempotent; [`wait_stopped`](Self::wait_stopped)
    /// completes once everything wound down.
    pub fn stop(&self) {
        if !self.store.is_shutting_down() {
            self.store
                .dispatch(Action::Shutdown { reason: ShutdownReason::Stop });
        }
    }

    /// Wait for the engine to finish, flush the final state and close the
    /// storage backend.
    pub async fn wait_stopped(self) -> anyhow::Result<ShutdownReason> {
        let reason = self.engine.await.context("engine task panicked")?;
        let _ = self.stop_persist.send(true);
        self.persist.await.context("persistence task panicked")?;
        Ok(reason)
    }

    fn channel_key(&self, token: &str, partner: &str) -> Result<ChannelKey, EngineError> {
        let token: Address = token.parse()?;
        let partner: Address = partner.parse()?;
        let token_network = self
            .store
            .snapshot()
            .token_network(&token)
            .ok_or(EngineError::UnknownTokenNetwork(token))?;
        Ok(ChannelKey { token_network, partner })
    }

    fn channel_sub(&self, meta: ChannelKey) -> Subscription {
        self.store
            .subscribe(ActionFilter::topics(vec![ActionTopic::Channels]).channel(meta))
    }
}

/// Await the success/failure pair of one channel request.
async fn channel_outcome<F>(mut sub: Subscription, map: F) -> Result<Hash, EngineError>
where
    F: Fn(Action) -> Option<Result<Hash, EngineError>>,
{
    loop {
        match sub.recv().await {
            Ok(Action::Shutdown { reason }) => return Err(EngineError::ShuttingDown(reason)),
            Ok(action) => {
                if let Some(outcome) = map(action) {
                    return outcome;
                }
            }
            Err(_) => return Err(EngineError::Transport("action stream closed".to_string())),
        }
    }
}

/// Follow configuration updates and apply log-level changes in place.
fn spawn_log_level_watcher(log: LogHandle, mut config_rx: watch::Receiver<EngineConfig>) {
    tokio::spawn(async move {
        let mut current = config_rx.borrow().log_level.clone();
        while config_rx.changed().await.is_ok() {
            let level = config_rx.borrow().log_level.clone();
            if level != current {
                if let Some(level) = &level {
                    log.set_level(level);
                }
                current = level;
            }
        }
    });
}
