//! # Relay Credential Cache
//!
//! Turn credentials are fetched from the transport server and reused across
//! negotiation attempts until their lifetime runs out. A fetch failure is
//! not fatal; negotiation proceeds without relay servers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pc_transport::{TransportClient, TurnServers};
use tokio::time::Instant;
use tracing::warn;

/// Lifetime assumed when the server does not state one.
const FALLBACK_TTL: Duration = Duration::from_secs(3600);

#[derive(Default)]
pub struct IceCache {
    cached: Mutex<Option<(TurnServers, Instant)>>,
}

impl IceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current relay credentials, refetched once the cached ones expire.
    pub async fn get(&self, client: &Arc<dyn TransportClient>) -> TurnServers {
        if let Some((servers, expiry)) = self.cached.lock().clone() {
            if Instant::now() < expiry {
                return servers;
            }
        }
        match client.turn_servers().await {
            Ok(servers) => {
                let ttl = servers
                    .ttl_secs
                    .map_or(FALLBACK_TTL, Duration::from_secs);
                *self.cached.lock() = Some((servers.clone(), Instant::now() + ttl));
                servers
            }
            Err(err) => {
                warn!(%err, "turn credential fetch failed");
                TurnServers::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pc_transport::{TransportEvent, UserInfo};
    use shared_types::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    struct CountingClient {
        fetches: AtomicU32,
        events_tx: broadcast::Sender<TransportEvent>,
        ttl_secs: Option<u64>,
    }

    impl CountingClient {
        fn new(ttl_secs: Option<u64>) -> Arc<Self> {
            let (events_tx, _) = broadcast::channel(1);
            Arc::new(Self { fetches: AtomicU32::new(0), events_tx, ttl_secs })
        }
    }

    #[async_trait]
    impl TransportClient for CountingClient {
        fn user_id(&self) -> String {
            "@own:server".to_string()
        }

        fn device_id(&self) -> String {
            String::new()
        }

        fn access_token(&self) -> String {
            String::new()
        }

        fn events(&self) -> broadcast::Receiver<TransportEvent> {
            self.events_tx.subscribe()
        }

        async fn set_display_name(&self, _name: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn set_capabilities(&self, _caps: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn set_presence(&self, _available: bool) -> Result<(), EngineError> {
            Ok(())
        }

        async fn search_users(&self, _localpart: &str) -> Result<Vec<UserInfo>, EngineError> {
            Ok(Vec::new())
        }

        async fn track_presence(&self, _user_id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn presence_status(
            &self,
            _user_id: &str,
        ) -> Result<pc_transport::UserPresence, EngineError> {
            Ok(pc_transport::UserPresence { available: true, ts: 0 })
        }

        async fn open_room(&self, _user_id: &str) -> Result<String, EngineError> {
            Ok(String::new())
        }

        async fn join_room(&self, _room_id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn leave_room(&self, _room_id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn send(&self, _r: &str, _t: &str, _b: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn turn_servers(&self) -> Result<TurnServers, EngineError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(TurnServers {
                uris: vec!["turn:relay.example".to_string()],
                username: "u".to_string(),
                password: "p".to_string(),
                ttl_secs: self.ttl_secs,
            })
        }

        async fn logout(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_credentials_cached_until_expiry() {
        let counting = CountingClient::new(Some(60));
        let client: Arc<dyn TransportClient> = counting.clone();
        let cache = IceCache::new();

        let first = cache.get(&client).await;
        let second = cache.get(&client).await;
        assert_eq!(first, second);
        assert_eq!(counting.fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get(&client).await;
        assert_eq!(counting.fetches.load(Ordering::SeqCst), 2);
    }
}
