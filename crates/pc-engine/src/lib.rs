//! # Epic Engine
//!
//! The concurrency layer: epics are supervised tasks over the action stream,
//! the [`Latest`] model gives them a combined read view, and [`EpicEngine`]
//! coordinates startup ordering and grace-bounded shutdown.
//!
//! ```text
//!          ┌───────────────── EpicEngine ─────────────────┐
//!          │  spawn           supervise          shutdown │
//!          │    │                 │             grace+abort│
//!   store ─┼──▶ epic tasks ──────▶ join results ──────────┤
//!          │    ▲                                         │
//!          │    └── Latest watch (state+config+presence)  │
//!          └──────────────────────────────────────────────┘
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod engine;
pub mod epic;
pub mod latest;

pub use engine::EpicEngine;
pub use epic::{Epic, EpicContext};
pub use latest::{spawn_latest, Latest, Presence};
