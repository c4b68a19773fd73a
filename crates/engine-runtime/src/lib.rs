//! # Engine Runtime
//!
//! Assembles the full off-chain engine and fronts it with an imperative
//! API. Everything underneath runs on the action stream; the facade only
//! translates calls into requests and awaits their outcomes.
//!
//! ```text
//!                         +------------------+
//!        open_channel --->|                  |---> ChannelOpenRequest
//!        transfer ------->|      Engine      |---> TransferRequest
//!        stop ----------->|     (facade)     |---> Shutdown
//!                         +--------+---------+
//!                                  |
//!                                  v
//!                         +------------------+
//!                         |    StateStore    |  reduce, then broadcast
//!                         +--------+---------+
//!                                  |
//!            +---------------+-----+------+----------------+
//!            v               v            v                v
//!      channel epics   transport epics  data-channel   transfer epic
//!      (chain port)    (server port)    epic (peers)   (signer)
//! ```
//!
//! The runtime also owns the ambient concerns: tracing setup with a
//! reloadable level filter, debounced state persistence and in-memory
//! doubles for every backend port.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod doubles;
pub mod engine;
pub mod ids;
pub mod logging;
pub mod transfers;

pub use engine::{Availability, Engine, EngineOptions, TransferOptions};
pub use ids::next_id;
pub use logging::{init_logging, LogHandle};
pub use transfers::TransferEpic;
