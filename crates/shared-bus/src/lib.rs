//! # Shared Bus - The Action Stream
//!
//! Every state change and every side-effect trigger in the engine is an
//! immutable [`Action`] value flowing through one [`ActionBus`]. Reducers
//! apply actions to state; epics observe the same stream and emit follow-up
//! actions as their asynchronous work completes.
//!
//! ```text
//! facade ──dispatch──┐
//!                    ▼
//!              ┌───────────┐   subscribe    ┌────────┐
//!              │ ActionBus │ ─────────────▶ │ epic N │
//!              └───────────┘ ◀──── emit ─── └────────┘
//! ```
//!
//! Delivery is a single global order: no subscriber sees an action "ahead"
//! of another. Request/success/failure triples share a meta key so callers
//! can correlate an outcome with their request.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod actions;
pub mod bus;

pub use actions::{Action, ActionFilter, ActionTopic, Confirmation, MessageId};
pub use bus::{ActionBus, BusError, Subscription};

/// Maximum actions buffered per subscriber before lag kicks in.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
