//! # Epic Contract
//!
//! An epic is a long-lived task that observes the action stream and emits
//! follow-up actions as its asynchronous work completes. Epics never mutate
//! state directly; everything goes back through the store.

use std::sync::Arc;

use async_trait::async_trait;
use pc_state::{EngineState, StateStore};
use shared_bus::{Action, ActionFilter, Subscription};
use shared_types::{EngineConfig, EngineError};
use tokio::sync::watch;

use crate::latest::Latest;

/// A supervised unit of side-effect logic.
///
/// `run` should return `Ok(())` once the terminal shutdown action has been
/// observed and in-flight work is wound down. Returning an error is fatal
/// for the whole engine.
#[async_trait]
pub trait Epic: Send + Sync + 'static {
    /// Stable name, used in logs and shutdown diagnostics.
    fn name(&self) -> &'static str;

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError>;
}

/// Everything an epic needs: the store, the latest read model and the
/// start barrier. Cheap to clone.
#[derive(Clone)]
pub struct EpicContext {
    store: Arc<StateStore>,
    latest: watch::Receiver<Latest>,
    started: watch::Receiver<bool>,
}

impl EpicContext {
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        latest: watch::Receiver<Latest>,
        started: watch::Receiver<bool>,
    ) -> Self {
        Self { store, latest, started }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Subscribe to the action stream.
    #[must_use]
    pub fn subscribe(&self, filter: ActionFilter) -> Subscription {
        self.store.subscribe(filter)
    }

    /// Emit a follow-up action. Always allowed, including during the
    /// shutdown grace period.
    pub fn dispatch(&self, action: Action) {
        self.store.dispatch(action);
    }

    /// Current state snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EngineState> {
        self.store.snapshot()
    }

    /// Current effective configuration.
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.store.config()
    }

    /// Copy of the latest derived model.
    #[must_use]
    pub fn latest(&self) -> Latest {
        self.latest.borrow().clone()
    }

    /// Watch receiver over the latest derived model.
    #[must_use]
    pub fn watch_latest(&self) -> watch::Receiver<Latest> {
        self.latest.clone()
    }

    /// True once shutdown has been dispatched.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.store.is_shutting_down()
    }

    /// Wait until every epic has been spawned and subscribed.
    ///
    /// Epics that talk to the outside world gate their first outbound call
    /// on this, so actions they trigger cannot be missed by later epics.
    pub async fn wait_started(&self) {
        let mut started = self.started.clone();
        while !*started.borrow() {
            if started.changed().await.is_err() {
                return;
            }
        }
    }
}
