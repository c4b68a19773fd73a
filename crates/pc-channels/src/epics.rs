//! # Channel Lifecycle Epics
//!
//! One epic per on-chain operation, plus the block poller, the confirmation
//! tracker and the settle-timeout watcher. Request epics re-check the state
//! snapshot before submitting a transaction: the reducer ran before they saw
//! the request, so a request rejected by its guard surfaces as a failure
//! action instead of a stray transaction.

use std::sync::Arc;

use async_trait::async_trait;
use pc_engine::{Epic, EpicContext};
use pc_state::ChannelState;
use shared_bus::{Action, ActionFilter, ActionTopic, Confirmation};
use shared_types::{ChannelKey, EngineError};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ports::ChainClient;

fn channels_filter() -> ActionFilter {
    ActionFilter::topics(vec![ActionTopic::Channels])
}

fn chain_filter() -> ActionFilter {
    ActionFilter::topics(vec![ActionTopic::Chain])
}

fn unconfirmed(tx_hash: shared_types::Hash, tx_block: u64) -> Confirmation {
    Confirmation { tx_hash, tx_block, confirmed: None }
}

fn state_error(ctx: &EpicContext, meta: ChannelKey) -> EngineError {
    match ctx.snapshot().channel(&meta) {
        Some(channel) => EngineError::InvalidChannelState {
            key: meta,
            state: channel.state.to_string(),
        },
        None => EngineError::NoChannelFound(meta),
    }
}

/// Polls the chain head and turns it into `NewBlock` actions.
pub struct BlockPollEpic {
    chain: Arc<dyn ChainClient>,
}

impl BlockPollEpic {
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Epic for BlockPollEpic {
    fn name(&self) -> &'static str {
        "block_poll"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut shutdown = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Shutdown]));
        ctx.wait_started().await;
        loop {
            // interval re-read each round so config updates apply live
            let interval = ctx.config().polling_interval();
            tokio::select! {
                () = sleep(interval) => {
                    match self.chain.block_number().await {
                        Ok(block) if block > ctx.snapshot().block_number => {
                            ctx.dispatch(Action::NewBlock { block_number: block });
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "block poll failed"),
                    }
                }
                received = shutdown.recv() => {
                    if received.is_err() || matches!(received, Ok(Action::Shutdown { .. })) {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Handles `ChannelOpenRequest` by submitting the open transaction.
pub struct ChannelOpenEpic {
    chain: Arc<dyn ChainClient>,
}

impl ChannelOpenEpic {
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Epic for ChannelOpenEpic {
    fn name(&self) -> &'static str {
        "channel_open"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(channels_filter());
        ctx.wait_started().await;
        while let Ok(action) = sub.recv().await {
            let (meta, settle_timeout) = match action {
                Action::Shutdown { .. } => break,
                Action::ChannelOpenRequest { meta, settle_timeout } => (meta, settle_timeout),
                _ => continue,
            };
            // the reducer rejected the request if a channel already existed
            if ctx.snapshot().channel(&meta).map(|c| c.state) != Some(ChannelState::Opening) {
                ctx.dispatch(Action::ChannelOpenFailure { meta, error: state_error(&ctx, meta) });
                continue;
            }
            match self
                .chain
                .open_channel(meta.token_network, meta.partner, settle_timeout)
                .await
            {
                Ok(outcome) => {
                    debug!(%meta, id = outcome.id, "channel open submitted");
                    ctx.dispatch(Action::ChannelOpenSuccess {
                        meta,
                        id: outcome.id,
                        settle_timeout,
                        is_first_participant: outcome.is_first_participant,
                        confirmation: unconfirmed(outcome.tx.tx_hash, outcome.tx.block),
                    });
                }
                Err(error) => ctx.dispatch(Action::ChannelOpenFailure { meta, error }),
            }
        }
        Ok(())
    }
}

/// Handles `ChannelDepositRequest` by raising our on-chain total deposit.
pub struct ChannelDepositEpic {
    chain: Arc<dyn ChainClient>,
}

impl ChannelDepositEpic {
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Epic for ChannelDepositEpic {
    fn name(&self) -> &'static str {
        "channel_deposit"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(channels_filter());
        ctx.wait_started().await;
        while let Ok(action) = sub.recv().await {
            let (meta, deposit) = match action {
                Action::Shutdown { .. } => break,
                Action::ChannelDepositRequest { meta, deposit } => (meta, deposit),
                _ => continue,
            };
            let snapshot = ctx.snapshot();
            let Some((id, own_deposit)) = snapshot
                .channel(&meta)
                .filter(|c| c.state == ChannelState::Open)
                .and_then(|c| c.id.map(|id| (id, c.own.deposit)))
            else {
                ctx.dispatch(Action::ChannelDepositFailure { meta, error: state_error(&ctx, meta) });
                continue;
            };
            // the contract takes monotonic totals, not deltas
            let total_deposit = own_deposit + deposit;
            match self
                .chain
                .set_total_deposit(meta.token_network, id, meta.partner, total_deposit)
                .await
            {
                Ok(outcome) => ctx.dispatch(Action::ChannelDepositSuccess {
                    meta,
                    id,
                    participant: snapshot.address,
                    total_deposit,
                    confirmation: unconfirmed(outcome.tx_hash, outcome.block),
                }),
                Err(error) => ctx.dispatch(Action::ChannelDepositFailure { meta, error }),
            }
        }
        Ok(())
    }
}

/// Handles `ChannelCloseRequest` by submitting the close transaction.
pub struct ChannelCloseEpic {
    chain: Arc<dyn ChainClient>,
}

impl ChannelCloseEpic {
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Epic for ChannelCloseEpic {
    fn name(&self) -> &'static str {
        "channel_close"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(channels_filter());
        ctx.wait_started().await;
        while let Ok(action) = sub.recv().await {
            let meta = match action {
                Action::Shutdown { .. } => break,
                Action::ChannelCloseRequest { meta } => meta,
                _ => continue,
            };
            let snapshot = ctx.snapshot();
            // reducer moved open -> closing before we got here
            let Some(id) = snapshot
                .channel(&meta)
                .filter(|c| matches!(c.state, ChannelState::Open | ChannelState::Closing))
                .and_then(|c| c.id)
            else {
                ctx.dispatch(Action::ChannelCloseFailure { meta, error: state_error(&ctx, meta) });
                continue;
            };
            match self
                .chain
                .close_channel(meta.token_network, id, meta.partner)
                .await
            {
                Ok(outcome) => ctx.dispatch(Action::ChannelCloseSuccess {
                    meta,
                    id,
                    participant: snapshot.address,
                    confirmation: unconfirmed(outcome.tx_hash, outcome.block),
                }),
                Err(error) => ctx.dispatch(Action::ChannelCloseFailure { meta, error }),
            }
        }
        Ok(())
    }
}

/// Handles `ChannelSettleRequest` by submitting the settle transaction.
pub struct ChannelSettleEpic {
    chain: Arc<dyn ChainClient>,
}

impl ChannelSettleEpic {
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Epic for ChannelSettleEpic {
    fn name(&self) -> &'static str {
        "channel_settle"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(channels_filter());
        ctx.wait_started().await;
        while let Ok(action) = sub.recv().await {
            let meta = match action {
                Action::Shutdown { .. } => break,
                Action::ChannelSettleRequest { meta } => meta,
                _ => continue,
            };
            let Some(id) = ctx
                .snapshot()
                .channel(&meta)
                .filter(|c| matches!(c.state, ChannelState::Settleable | ChannelState::Settling))
                .and_then(|c| c.id)
            else {
                ctx.dispatch(Action::ChannelSettleFailure { meta, error: state_error(&ctx, meta) });
                continue;
            };
            match self
                .chain
                .settle_channel(meta.token_network, id, meta.partner)
                .await
            {
                Ok(outcome) => ctx.dispatch(Action::ChannelSettleSuccess {
                    meta,
                    id,
                    confirmation: unconfirmed(outcome.tx_hash, outcome.block),
                }),
                Err(error) => ctx.dispatch(Action::ChannelSettleFailure { meta, error }),
            }
        }
        Ok(())
    }
}

/// Resolves pending on-chain observations once enough blocks passed.
///
/// An observation whose transaction still stands after `confirmation_blocks`
/// is re-emitted as confirmed; one whose transaction was dropped by a reorg
/// is re-emitted as reverted, which reducers treat as a no-op removal.
pub struct ConfirmationEpic {
    chain: Arc<dyn ChainClient>,
}

impl ConfirmationEpic {
    #[must_use]
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Epic for ConfirmationEpic {
    fn name(&self) -> &'static str {
        "confirmation"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(chain_filter());
        ctx.wait_started().await;
        while let Ok(action) = sub.recv().await {
            let block = match action {
                Action::Shutdown { .. } => break,
                Action::NewBlock { block_number } => block_number,
                _ => continue,
            };
            let confirmation_blocks = ctx.config().confirmation_blocks;
            let due: Vec<Action> = ctx
                .snapshot()
                .pending_txs
                .iter()
                .filter(|pending| {
                    pending
                        .confirmation()
                        .is_some_and(|c| c.tx_block + confirmation_blocks <= block)
                })
                .cloned()
                .collect();
            for pending in due {
                let Some(confirmation) = pending.confirmation() else { continue };
                match self.chain.transaction_block(confirmation.tx_hash).await {
                    Ok(included) => {
                        let confirmed = included.is_some();
                        if !confirmed {
                            warn!(tx = %confirmation.tx_hash, "transaction reorged out");
                        }
                        if let Some(resolved) = pending.with_confirmed(Some(confirmed)) {
                            ctx.dispatch(resolved);
                        }
                    }
                    // leave it pending; retried on the next block
                    Err(err) => warn!(%err, tx = %confirmation.tx_hash, "confirmation check failed"),
                }
            }
        }
        Ok(())
    }
}

/// Emits `ChannelSettleable` once a closed channel's settle timeout elapsed.
pub struct SettleableWatchEpic;

#[async_trait]
impl Epic for SettleableWatchEpic {
    fn name(&self) -> &'static str {
        "settleable_watch"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(chain_filter());
        ctx.wait_started().await;
        while let Ok(action) = sub.recv().await {
            let block = match action {
                Action::Shutdown { .. } => break,
                Action::NewBlock { block_number } => block_number,
                _ => continue,
            };
            let snapshot = ctx.snapshot();
            for (meta, channel) in &snapshot.channels {
                if channel.state != ChannelState::Closed {
                    continue;
                }
                let (Some(close_block), Some(settle_timeout)) =
                    (channel.close_block, channel.settle_timeout)
                else {
                    continue;
                };
                let settleable_block = close_block + settle_timeout;
                if settleable_block <= block {
                    ctx.dispatch(Action::ChannelSettleable { meta: *meta, settleable_block });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{OpenOutcome, TxOutcome};
    use pc_engine::EpicEngine;
    use pc_state::{EngineState, StateStore};
    use shared_bus::ActionBus;
    use shared_types::{Address, EngineConfig, Hash, ShutdownReason, TokenAmount, U256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::task::JoinHandle;

    const OWN: [u8; 20] = [0xAA; 20];

    fn key() -> ChannelKey {
        ChannelKey {
            token_network: Address::new([0x01; 20]),
            partner: Address::new([0x02; 20]),
        }
    }

    #[derive(Default)]
    struct FakeChain {
        block: AtomicU64,
        tx_counter: AtomicU64,
        included: parking_lot::Mutex<HashMap<Hash, u64>>,
        fail_open: AtomicBool,
    }

    impl FakeChain {
        fn submit(&self) -> TxOutcome {
            let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
            let block = self.block.load(Ordering::SeqCst);
            let tx_hash = Hash::keccak(&n.to_be_bytes());
            self.included.lock().insert(tx_hash, block);
            TxOutcome { tx_hash, block }
        }

        fn reorg_out(&self, tx_hash: Hash) {
            self.included.lock().remove(&tx_hash);
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn block_number(&self) -> Result<u64, EngineError> {
            Ok(self.block.load(Ordering::SeqCst))
        }

        async fn open_channel(
            &self,
            _token_network: Address,
            _partner: Address,
            _settle_timeout: u64,
        ) -> Result<OpenOutcome, EngineError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(EngineError::TxFailed("open reverted".to_string()));
            }
            Ok(OpenOutcome { tx: self.submit(), id: 17, is_first_participant: true })
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

        async fn transaction_block(&self, tx_hash: Hash) -> Result<Option<u64>, EngineError> {
            Ok(self.included.lock().get(&tx_hash).copied())
        }
    }

    async fn harness(
        chain: Arc<FakeChain>,
    ) -> (Arc<StateStore>, JoinHandle<ShutdownReason>) {
        let store = StateStore::new(
            ActionBus::new(),
            EngineState::new(Address::new(OWN), U256::from(5)),
            EngineConfig {
                confirmation_blocks: 2,
                shutdown_grace_ms: 2_000,
                ..Default::default()
            },
        );
        let mut engine = EpicEngine::new(store.clone());
        engine.register(Arc::new(ChannelOpenEpic::new(chain.clone())));
        engine.register(Arc::new(ChannelDepositEpic::new(chain.clone())));
        engine.register(Arc::new(ChannelCloseEpic::new(chain.clone())));
        engine.register(Arc::new(ChannelSettleEpic::new(chain.clone())));
        engine.register(Arc::new(ConfirmationEpic::new(chain.clone())));
        engine.register(Arc::new(SettleableWatchEpic));
        let handle = tokio::spawn(engine.run());
        // supervisor + latest + six epics
        while store.bus().subscriber_count() < 8 {
            tokio::task::yield_now().await;
        }
        (store, handle)
    }

    async fn stop(store: &StateStore, handle: JoinHandle<ShutdownReason>) {
        store.dispatch(Action::Shutdown { reason: ShutdownReason::Stop });
        handle.await.unwrap();
    }

    async fn wait_for(
        sub: &mut shared_bus::Subscription,
        pred: impl FnMut(&Action) -> bool,
    ) -> Action {
        tokio::time::timeout(std::time::Duration::from_secs(5), sub.find(pred))
            .await
            .expect("timed out waiting for action")
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_request_to_confirmed_channel() {
        let chain = Arc::new(FakeChain::default());
        chain.block.store(10, Ordering::SeqCst);
        let (store, handle) = harness(chain).await;
        let mut sub = store.subscribe(channels_filter());

        store.dispatch(Action::ChannelOpenRequest { meta: key(), settle_timeout: 500 });
        wait_for(&mut sub, |a| {
            matches!(a, Action::ChannelOpenSuccess { confirmation, .. } if confirmation.confirmed.is_none())
        })
        .await;
        assert_eq!(store.snapshot().pending_txs.len(), 1);
        assert_eq!(
            store.snapshot().channel(&key()).unwrap().state,
            ChannelState::Opening
        );

        // enough blocks pass; the observation gets confirmed and applied
        store.dispatch(Action::NewBlock { block_number: 12 });
        wait_for(&mut sub, |a| {
            matches!(a, Action::ChannelOpenSuccess { confirmation, .. } if confirmation.confirmed == Some(true))
        })
        .await;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.channel(&key()).unwrap().state, ChannelState::Open);
        assert!(snapshot.pending_txs.is_empty());

        stop(&store, handle).await;
    }

    #[tokio::test]
    async fn test_open_failure_removes_channel() {
        let chain = Arc::new(FakeChain::default());
        chain.fail_open.store(true, Ordering::SeqCst);
        let (store, handle) = harness(chain).await;
        let mut sub = store.subscribe(channels_filter());

        store.dispatch(Action::ChannelOpenRequest { meta: key(), settle_timeout: 500 });
        wait_for(&mut sub, |a| matches!(a, Action::ChannelOpenFailure { .. })).await;
        assert!(store.snapshot().channel(&key()).is_none());

        stop(&store, handle).await;
    }

    #[tokio::test]
    async fn test_open_request_racing_existing_channel_fails() {
        let chain = Arc::new(FakeChain::default());
        let (store, handle) = harness(chain).await;
        let mut sub = store.subscribe(channels_filter());

        // partner's open confirmed first
        store.dispatch(Action::ChannelOpenSuccess {
            meta: key(),
            id: 33,
            settle_timeout: 500,
            is_first_participant: false,
            confirmation: Confirmation {
                tx_hash: Hash::keccak(b"partner"),
                tx_block: 5,
                confirmed: Some(true),
            },
        });

        store.dispatch(Action::ChannelOpenRequest { meta: key(), settle_timeout: 500 });
        wait_for(&mut sub, |a| matches!(a, Action::ChannelOpenFailure { .. })).await;
        // the existing channel is untouched
        assert_eq!(store.snapshot().channel(&key()).unwrap().id, Some(33));

        stop(&store, handle).await;
    }

    #[tokio::test]
    async fn test_reverted_close_leaves_channel_closing() {
        let chain = Arc::new(FakeChain::default());
        chain.block.store(10, Ordering::SeqCst);
        let (store, handle) = harness(chain.clone()).await;
        let mut sub = store.subscribe(channels_filter());

        store.dispatch(Action::ChannelOpenSuccess {
            meta: key(),
            id: 17,
            settle_timeout: 500,
            is_first_participant: true,
            confirmation: Confirmation {
                tx_hash: Hash::keccak(b"open"),
                tx_block: 5,
                confirmed: Some(true),
            },
        });

        store.dispatch(Action::ChannelCloseRequest { meta: key() });
        let submitted = wait_for(&mut sub, |a| {
            matches!(a, Action::ChannelCloseSuccess { confirmation, .. } if confirmation.confirmed.is_none())
        })
        .await;
        let tx_hash = submitted.confirmation().unwrap().tx_hash;

        // the close transaction drops out in a reorg
        chain.reorg_out(tx_hash);
        store.dispatch(Action::NewBlock { block_number: 20 });
        wait_for(&mut sub, |a| {
            matches!(a, Action::ChannelCloseSuccess { confirmation, .. } if confirmation.confirmed == Some(false))
        })
        .await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.channel(&key()).unwrap().state, ChannelState::Closing);
        assert!(snapshot.pending_txs.is_empty());

        stop(&store, handle).await;
    }

    #[tokio::test]
    async fn test_deposit_submits_monotonic_total() {
        let chain = Arc::new(FakeChain::default());
        let (store, handle) = harness(chain).await;
        let mut sub = store.subscribe(channels_filter());

        store.dispatch(Action::ChannelOpenSuccess {
            meta: key(),
            id: 17,
            settle_timeout: 500,
            is_first_participant: true,
            confirmation: Confirmation {
                tx_hash: Hash::keccak(b"open"),
                tx_block: 5,
                confirmed: Some(true),
            },
        });

        store.dispatch(Action::ChannelDepositRequest {
            meta: key(),
            deposit: TokenAmount::from(100),
        });
        let action = wait_for(&mut sub, |a| matches!(a, Action::ChannelDepositSuccess { .. })).await;
        let Action::ChannelDepositSuccess { total_deposit, participant, .. } = action else {
            unreachable!()
        };
        assert_eq!(total_deposit, TokenAmount::from(100));
        assert_eq!(participant, Address::new(OWN));

        stop(&store, handle).await;
    }

    #[tokio::test]
    async fn test_deposit_without_open_channel_fails() {
        let chain = Arc::new(FakeChain::default());
        let (store, handle) = harness(chain).await;
        let mut sub = store.subscribe(channels_filter());

        store.dispatch(Action::ChannelDepositRequest {
            meta: key(),
            deposit: TokenAmount::from(100),
        });
        let action = wait_for(&mut sub, |a| matches!(a, Action::ChannelDepositFailure { .. })).await;
        let Action::ChannelDepositFailure { error, .. } = action else { unreachable!() };
        assert!(matches!(error, EngineError::NoChannelFound(_)));

        stop(&store, handle).await;
    }

    #[tokio::test]
    async fn test_settle_timeout_drives_settleable_then_settle() {
        let chain = Arc::new(FakeChain::default());
        chain.block.store(600, Ordering::SeqCst);
        let (store, handle) = harness(chain).await;
        let mut sub = store.subscribe(channels_filter());

        store.dispatch(Action::ChannelOpenSuccess {
            meta: key(),
            id: 17,
            settle_timeout: 500,
            is_first_participant: true,
            confirmation: Confirmation {
                tx_hash: Hash::keccak(b"open"),
                tx_block: 5,
                confirmed: Some(true),
            },
        });
        store.dispatch(Action::ChannelCloseSuccess {
            meta: key(),
            id: 17,
            participant: Address::new(OWN),
            confirmation: Confirmation {
                tx_hash: Hash::keccak(b"close"),
                tx_block: 100,
                confirmed: Some(true),
            },
        });

        // settle timeout of 500 elapsed at block 600
        store.dispatch(Action::NewBlock { block_number: 600 });
        wait_for(&mut sub, |a| {
            matches!(a, Action::ChannelSettleable { settleable_block: 600, .. })
        })
        .await;
        assert_eq!(
            store.snapshot().channel(&key()).unwrap().state,
            ChannelState::Settleable
        );

        store.dispatch(Action::ChannelSettleRequest { meta: key() });
        wait_for(&mut sub, |a| matches!(a, Action::ChannelSettleSuccess { .. })).await;

        // confirmation retires the channel into the history archive
        store.dispatch(Action::NewBlock { block_number: 610 });
        wait_for(&mut sub, |a| {
            matches!(a, Action::ChannelSettleSuccess { confirmation, .. } if confirmation.confirmed == Some(true))
        })
        .await;
        let snapshot = store.snapshot();
        assert!(snapshot.channel(&key()).is_none());
        assert!(snapshot.old_channel(&key(), 17).is_some());

        stop(&store, handle).await;
    }
}
