//! # State Store
//!
//! Owns the state tree and the action bus. `dispatch` reduces under a lock
//! and only then broadcasts, so by the time any epic observes an action the
//! state it produced is already visible. That ordering is what lets epics
//! read `snapshot()` right after `recv()` and trust it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shared_bus::{Action, ActionBus, ActionFilter, Subscription};
use shared_types::{EngineConfig, EngineError, ShutdownReason};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::reducers;
use crate::state::EngineState;

/// The dispatching state store shared by every epic and the facade.
pub struct StateStore {
    bus: ActionBus,
    state: Mutex<Arc<EngineState>>,
    snapshot_tx: watch::Sender<Arc<EngineState>>,
    config_tx: watch::Sender<EngineConfig>,
    defaults: EngineConfig,
    shutting_down: AtomicBool,
}

impl StateStore {
    /// Create a store over `initial` state, publishing to `bus`.
    ///
    /// `defaults` is the built-in configuration the persisted overlay is
    /// merged onto.
    #[must_use]
    pub fn new(bus: ActionBus, initial: EngineState, defaults: EngineConfig) -> Arc<Self> {
        let state = Arc::new(initial);
        let (snapshot_tx, _) = watch::channel(state.clone());
        let (config_tx, _) = watch::channel(defaults.merged(&state.config));
        Arc::new(Self {
            bus,
            state: Mutex::new(state),
            snapshot_tx,
            config_tx,
            defaults,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Current state snapshot. Cheap (Arc clone) and immutable.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EngineState> {
        self.state.lock().clone()
    }

    /// Watch receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<Arc<EngineState>> {
        self.snapshot_tx.subscribe()
    }

    /// Effective configuration (defaults merged with the stored overlay).
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config_tx.borrow().clone()
    }

    /// Watch receiver notified whenever the effective configuration changes.
    #[must_use]
    pub fn watch_config(&self) -> watch::Receiver<EngineConfig> {
        self.config_tx.subscribe()
    }

    /// Subscribe to the underlying action stream.
    #[must_use]
    pub fn subscribe(&self, filter: ActionFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    /// The bus itself, for components that only publish.
    #[must_use]
    pub fn bus(&self) -> &ActionBus {
        &self.bus
    }

    /// True once a shutdown action has been dispatched.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Reduce then broadcast. Epics and internal machinery use this; it
    /// stays open during the shutdown grace period so in-flight work can
    /// still record its outcome.
    pub fn dispatch(&self, action: Action) {
        if let Action::Shutdown { reason } = &action {
            info!(%reason, "shutdown dispatched");
            self.shutting_down.store(true, Ordering::Release);
        }
        {
            let mut guard = self.state.lock();
            let mut next = (**guard).clone();
            if reducers::reduce(&mut next, &action) {
                let next = Arc::new(next);
                *guard = next.clone();
                // watch subscribers see the new state before the action lands
                let _ = self.snapshot_tx.send(next.clone());
                let effective = self.defaults.merged(&next.config);
                if *self.config_tx.borrow() != effective {
                    debug!("effective config changed");
                    let _ = self.config_tx.send(effective);
                }
            }
        }
        self.bus.emit(action);
    }

    /// Dispatch on behalf of an external caller. Rejected once shutdown has
    /// begun, so the facade cannot start new work during the grace period.
    pub fn dispatch_external(&self, action: Action) -> Result<(), EngineError> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown(ShutdownReason::Stop));
        }
        self.dispatch(action);
        Ok(())
    }
}
