//! # Epic Engine
//!
//! Spawns every registered epic, supervises them and coordinates shutdown:
//! one epic failing is fatal for the whole engine, and after the terminal
//! shutdown action epics get a bounded grace period before stragglers are
//! named and aborted.

use std::collections::HashSet;
use std::sync::Arc;

use pc_state::StateStore;
use shared_bus::{Action, ActionFilter, ActionTopic};
use shared_types::{EngineError, ShutdownReason};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::epic::{Epic, EpicContext};
use crate::latest::spawn_latest;

/// Supervisor for all epics of one engine instance.
pub struct EpicEngine {
    store: Arc<StateStore>,
    epics: Vec<Arc<dyn Epic>>,
}

impl EpicEngine {
    #[must_use]
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store, epics: Vec::new() }
    }

    /// Register an epic to be spawned by [`run`](Self::run).
    pub fn register(&mut self, epic: Arc<dyn Epic>) {
        self.epics.push(epic);
    }

    /// Run until the terminal shutdown action and all epics are done.
    ///
    /// Returns the reason the engine stopped.
    pub async fn run(self) -> ShutdownReason {
        let store = self.store;
        let (latest_rx, latest_handle) = spawn_latest(store.clone());
        let (started_tx, started_rx) = watch::channel(false);
        let ctx = EpicContext::new(store.clone(), latest_rx, started_rx);

        // subscribed before any epic starts, so the terminal action cannot
        // slip past the supervisor
        let mut shutdown_sub = store.subscribe(ActionFilter::topics(vec![ActionTopic::Shutdown]));

        let mut tasks: JoinSet<(&'static str, Result<(), EngineError>)> = JoinSet::new();
        let mut live: HashSet<&'static str> = HashSet::new();
        for epic in self.epics {
            let name = epic.name();
            live.insert(name);
            let ctx = ctx.clone();
            tasks.spawn(async move { (name, epic.run(ctx).await) });
        }
        let _ = started_tx.send(true);
        info!(epics = live.len(), "engine started");

        // supervise until shutdown
        let reason = loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((name, Ok(()))) => {
                            live.remove(name);
                            // epics only finish cleanly after shutdown
                            warn!(epic = name, "epic finished before shutdown");
                        }
                        Ok((name, Err(err))) => {
                            live.remove(name);
                            error!(epic = name, %err, "epic failed");
                            store.dispatch(Action::Shutdown {
                                reason: ShutdownReason::Failed(format!("{name}: {err}")),
                            });
                        }
                        Err(join_err) => {
                            error!(%join_err, "epic panicked");
                            store.dispatch(Action::Shutdown {
                                reason: ShutdownReason::Failed(join_err.to_string()),
                            });
                        }
                    }
                }
                received = shutdown_sub.recv() => {
                    match received {
                        Ok(Action::Shutdown { reason }) => break reason,
                        Ok(_) => continue,
                        Err(_) => break ShutdownReason::Stop,
                    }
                }
            }
        };

        // grace period: let epics flush in-flight work, then abort the rest
        let grace = store.config().shutdown_grace();
        let deadline = sleep(grace);
        tokio::pin!(deadline);
        while !tasks.is_empty() {
            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok((name, result)) => {
                            live.remove(name);
                            if let Err(err) = result {
                                warn!(epic = name, %err, "epic failed during shutdown");
                            }
                        }
                        Err(join_err) => warn!(%join_err, "epic panicked during shutdown"),
                    }
                }
                _ = &mut deadline => {
                    let mut pending: Vec<&str> = live.iter().copied().collect();
                    pending.sort_unstable();
                    warn!(?pending, "grace period expired, aborting remaining epics");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        latest_handle.abort();
        let _ = latest_handle.await;
        info!(%reason, "engine stopped");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pc_state::EngineState;
    use shared_bus::ActionBus;
    use shared_types::{Address, EngineConfig, U256};

    fn store(grace_ms: u64) -> Arc<StateStore> {
        StateStore::new(
            ActionBus::new(),
            EngineState::new(Address::new([0xAA; 20]), U256::from(5)),
            EngineConfig { shutdown_grace_ms: grace_ms, ..Default::default() },
        )
    }

    /// Runs until it sees shutdown, then exits cleanly.
    struct WellBehaved;

    #[async_trait]
    impl Epic for WellBehaved {
        fn name(&self) -> &'static str {
            "well_behaved"
        }

        async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
            let mut sub = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Shutdown]));
            ctx.wait_started().await;
            while let Ok(action) = sub.recv().await {
                if matches!(action, Action::Shutdown { .. }) {
                    break;
                }
            }
            Ok(())
        }
    }

    /// Never observes shutdown; must be aborted after the grace period.
    struct Straggler;

    #[async_trait]
    impl Epic for Straggler {
        fn name(&self) -> &'static str {
            "straggler"
        }

        async fn run(self: Arc<Self>, _ctx: EpicContext) -> Result<(), EngineError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Fails immediately after start.
    struct Faulty;

    #[async_trait]
    impl Epic for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
            ctx.wait_started().await;
            Err(EngineError::Transport("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_clean_shutdown() {
        let store = store(10_000);
        let mut engine = EpicEngine::new(store.clone());
        engine.register(Arc::new(WellBehaved));

        let run = tokio::spawn(engine.run());
        tokio::task::yield_now().await;
        store.dispatch(Action::Shutdown { reason: ShutdownReason::Stop });

        let reason = run.await.unwrap();
        assert_eq!(reason, ShutdownReason::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_aborted_after_grace() {
        let store = store(1_000);
        let mut engine = EpicEngine::new(store.clone());
        engine.register(Arc::new(WellBehaved));
        engine.register(Arc::new(Straggler));

        let run = tokio::spawn(engine.run());
        tokio::task::yield_now().await;
        store.dispatch(Action::Shutdown { reason: ShutdownReason::Stop });

        // the straggler never exits on its own; run still terminates
        let reason = run.await.unwrap();
        assert_eq!(reason, ShutdownReason::Stop);
    }

    #[tokio::test]
    async fn test_epic_failure_is_fatal() {
        let store = store(100);
        let mut engine = EpicEngine::new(store.clone());
        engine.register(Arc::new(WellBehaved));
        engine.register(Arc::new(Faulty));

        let reason = engine.run().await;
        assert!(matches!(reason, ShutdownReason::Failed(_)));
        assert!(store.is_shutting_down());
    }
}
