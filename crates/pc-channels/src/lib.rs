//! # Channel Lifecycle
//!
//! Epics driving channels through open, deposit, close and settle against
//! the [`ChainClient`] port, plus confirmation tracking that makes every
//! on-chain observation reorg-safe before reducers act on it for good.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod epics;
pub mod ports;

pub use epics::{
    BlockPollEpic, ChannelCloseEpic, ChannelDepositEpic, ChannelOpenEpic, ChannelSettleEpic,
    ConfirmationEpic, SettleableWatchEpic,
};
pub use ports::{ChainClient, OpenOutcome, TxOutcome};
