//! # Chain Port
//!
//! Contract against the on-chain layer. Implementations submit transactions
//! and answer inclusion queries; they never touch engine state.

use async_trait::async_trait;
use shared_types::{Address, BlockNumber, EngineError, Hash, TokenAmount};

/// Outcome of a submitted transaction, as first observed (unconfirmed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub tx_hash: Hash,
    pub block: BlockNumber,
}

/// Outcome of an open-channel transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    pub tx: TxOutcome,
    /// Channel id assigned by the token network contract.
    pub id: u64,
    pub is_first_participant: bool,
}

/// Port for submitting channel transactions and tracking their finality.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest chain head.
    async fn block_number(&self) -> Result<BlockNumber, EngineError>;

    async fn open_channel(
        &self,
        token_network: Address,
        partner: Address,
        settle_timeout: u64,
    ) -> Result<OpenOutcome, EngineError>;

    /// Raise our total deposit in the channel to `total_deposit`.
    async fn set_total_deposit(
        &self,
        token_network: Address,
        channel_id: u64,
        partner: Address,
        total_deposit: TokenAmount,
    ) -> Result<TxOutcome, EngineError>;

    async fn close_channel(
        &self,
        token_network: Address,
        channel_id: u64,
        partner: Address,
    ) -> Result<TxOutcome, EngineError>;

    async fn settle_channel(
        &self,
        token_network: Address,
        channel_id: u64,
        partner: Address,
    ) -> Result<TxOutcome, EngineError>;

    /// Whether `tx_hash` is still included after reorgs: `Some(block)` if it
    /// stands at that block, `None` if it was dropped from the chain.
    async fn transaction_block(&self, tx_hash: Hash) -> Result<Option<BlockNumber>, EngineError>;
}
