//! # Latest Derived Model
//!
//! A continuously updated read model combining the persisted state tree with
//! volatile facts that only live in the action stream (peer presence, active
//! data-channel sessions). Epics read it through a watch channel instead of
//! replaying actions themselves.

use std::collections::HashMap;
use std::sync::Arc;

use pc_state::{EngineState, StateStore};
use shared_bus::{Action, ActionFilter};
use shared_types::{Address, Caps, EngineConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Last known presence of a monitored peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub user_id: String,
    pub available: bool,
    /// Event timestamp, for dropping out-of-order updates upstream.
    pub ts: u64,
    pub caps: Option<Caps>,
}

/// Combined snapshot of everything an epic usually needs per action.
#[derive(Clone)]
pub struct Latest {
    pub state: Arc<EngineState>,
    pub config: EngineConfig,
    /// Presence of monitored peers, keyed by address.
    pub presence: HashMap<Address, Presence>,
    /// Active peer data-channel sessions: address to call id.
    pub peer_sessions: HashMap<Address, String>,
}

impl Latest {
    fn initial(store: &StateStore) -> Self {
        Self {
            state: store.snapshot(),
            config: store.config(),
            presence: HashMap::new(),
            peer_sessions: HashMap::new(),
        }
    }

    /// Whether `address` is currently known available.
    #[must_use]
    pub fn is_available(&self, address: &Address) -> bool {
        self.presence.get(address).is_some_and(|p| p.available)
    }

    /// Whether a direct data channel to `address` is live.
    #[must_use]
    pub fn has_peer_session(&self, address: &Address) -> bool {
        self.peer_sessions.contains_key(address)
    }
}

/// Spawn the task keeping a [`Latest`] watch channel up to date.
///
/// The task follows every action and ends once the terminal shutdown action
/// has been observed; the final snapshot stays readable afterwards.
pub fn spawn_latest(store: Arc<StateStore>) -> (watch::Receiver<Latest>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(Latest::initial(&store));
    let mut sub = store.subscribe(ActionFilter::all());
    let handle = tokio::spawn(async move {
        while let Ok(action) = sub.recv().await {
            let done = matches!(action, Action::Shutdown { .. });
            tx.send_modify(|latest| {
                latest.state = store.snapshot();
                latest.config = store.config();
                match &action {
                    Action::PresenceUpdate { address, user_id, available, ts, caps } => {
                        latest.presence.insert(
                            *address,
                            Presence {
                                user_id: user_id.clone(),
                                available: *available,
                                ts: *ts,
                                caps: *caps,
                            },
                        );
                    }
                    Action::PeerSessionActive { address, call_id } => {
                        latest.peer_sessions.insert(*address, call_id.clone());
                    }
                    Action::PeerSessionInactive { address } => {
                        latest.peer_sessions.remove(address);
                    }
                    _ => {}
                }
            });
            if done {
                debug!("latest model stopped");
                break;
            }
        }
    });
    (rx, handle)
}
