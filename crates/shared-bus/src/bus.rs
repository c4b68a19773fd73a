//! # In-Memory Action Bus
//!
//! Tokio broadcast channel wrapped with topic filtering. Emission is
//! synchronous and infallible while at least one subscriber is alive;
//! slow subscribers lag and are told how many actions they missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::actions::{Action, ActionFilter};
use crate::DEFAULT_CHANNEL_CAPACITY;

/// Errors from bus operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus was dropped while a subscriber was still waiting.
    #[error("action bus closed")]
    Closed,
}

/// The engine-wide action stream.
///
/// Cloning is cheap; every clone publishes into the same stream.
#[derive(Clone)]
pub struct ActionBus {
    sender: broadcast::Sender<Action>,
    dispatched: Arc<AtomicU64>,
}

impl ActionBus {
    /// Create a bus with the default per-subscriber capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an action to every live subscriber.
    ///
    /// Returns the number of subscribers it reached. Zero subscribers is not
    /// an error: actions emitted before any epic attaches are simply dropped,
    /// which only happens during startup and teardown.
    pub fn emit(&self, action: Action) -> usize {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        trace!(topic = ?action.topic(), "emit");
        match self.sender.send(action) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("action emitted with no live subscribers");
                0
            }
        }
    }

    /// Subscribe with a filter. Actions not matching the filter are skipped
    /// inside [`Subscription::recv`] without waking the caller's logic.
    #[must_use]
    pub fn subscribe(&self, filter: ActionFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Total actions emitted since creation.
    #[must_use]
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Current number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ActionBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's filtered view of the action stream.
pub struct Subscription {
    receiver: broadcast::Receiver<Action>,
    filter: ActionFilter,
}

impl Subscription {
    /// Receive the next matching action.
    ///
    /// A lagged subscriber logs the number of skipped actions and keeps
    /// going from the oldest retained one rather than failing.
    pub async fn recv(&mut self) -> Result<Action, BusError> {
        loop {
            match self.receiver.recv().await {
                Ok(action) if self.filter.matches(&action) => return Ok(action),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, actions were dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Receive a matching action if one is already buffered.
    pub fn try_recv(&mut self) -> Result<Option<Action>, BusError> {
        loop {
            match self.receiver.try_recv() {
                Ok(action) if self.filter.matches(&action) => return Ok(Some(action)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged, actions were dropped");
                    continue;
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Wait for the first action satisfying `pred`.
    ///
    /// Used by facade calls to correlate a request with its outcome.
    pub async fn find<F>(&mut self, mut pred: F) -> Result<Action, BusError>
    where
        F: FnMut(&Action) -> bool,
    {
        loop {
            let action = self.recv().await?;
            if pred(&action) {
                return Ok(action);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionTopic;
    use shared_types::ShutdownReason;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = ActionBus::new();
        let mut sub = bus.subscribe(ActionFilter::all());

        bus.emit(Action::NewBlock { block_number: 7 });

        let action = sub.recv().await.unwrap();
        assert_eq!(action, Action::NewBlock { block_number: 7 });
        assert_eq!(bus.dispatched_count(), 1);
    }

    #[tokio::test]
    async fn test_filter_skips_other_topics() {
        let bus = ActionBus::new();
        let mut sub = bus.subscribe(ActionFilter::topics(vec![ActionTopic::Chain]));

        bus.emit(Action::PresenceRequest {
            address: shared_types::Address::new([1; 20]),
        });
        bus.emit(Action::NewBlock { block_number: 2 });

        let action = sub.recv().await.unwrap();
        assert_eq!(action, Action::NewBlock { block_number: 2 });
    }

    #[tokio::test]
    async fn test_all_subscribers_see_every_action() {
        let bus = ActionBus::new();
        let mut a = bus.subscribe(ActionFilter::all());
        let mut b = bus.subscribe(ActionFilter::all());

        let reached = bus.emit(Action::NewBlock { block_number: 1 });
        assert_eq!(reached, 2);
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_recovers() {
        let bus = ActionBus::with_capacity(4);
        let mut sub = bus.subscribe(ActionFilter::all());

        for n in 0..32 {
            bus.emit(Action::NewBlock { block_number: n });
        }

        // oldest retained action, not an error
        let action = sub.recv().await.unwrap();
        assert!(matches!(action, Action::NewBlock { .. }));
    }

    #[tokio::test]
    async fn test_find_correlates() {
        let bus = ActionBus::new();
        let mut sub = bus.subscribe(ActionFilter::all());

        bus.emit(Action::NewBlock { block_number: 1 });
        bus.emit(Action::Shutdown {
            reason: ShutdownReason::Stop,
        });

        let action = sub
            .find(|a| matches!(a, Action::Shutdown { .. }))
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::Shutdown {
                reason: ShutdownReason::Stop
            }
        );
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_dropped() {
        let bus = ActionBus::new();
        assert_eq!(bus.emit(Action::NewBlock { block_number: 1 }), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
