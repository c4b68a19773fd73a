//! # State Core
//!
//! The engine's single source of truth: a serializable [`EngineState`] tree,
//! pure [`reducers`] applying actions to it, and the [`StateStore`] which
//! guarantees reducers run before any subscriber observes the action that
//! caused them.
//!
//! Persistence is a port ([`Storage`]) with a debounced writer task, so the
//! state model itself never touches I/O.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod reducers;
pub mod state;
pub mod storage;
pub mod store;

pub use state::{Channel, ChannelEnd, ChannelState, EngineState, TransportState};
pub use storage::{spawn_persistence, MemoryStorage, Storage, StorageError};
pub use store::StateStore;
