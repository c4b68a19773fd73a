//! # Session Setup
//!
//! Picks a transport server and authenticates: a pinned server always wins,
//! stored credentials are tried next so restarts keep their identity, and
//! otherwise candidates from the published server list are attempted in
//! round-trip-time order, skipping servers whose probe failed.
//!
//! Account material is all derived from the signing key: the password is a
//! signature over the server name, the display name a signature over the
//! resulting user id. A server answering with a foreign user id is fatal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pc_engine::{Epic, EpicContext};
use shared_bus::{Action, ActionFilter, ActionTopic};
use shared_crypto::Signer;
use shared_types::{EngineConfig, EngineError, TransportCredentials};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::caps::stringify_caps;
use crate::ports::{Session, TransportClient, TransportFactory};

/// Server URL without scheme or trailing slash; the string that gets signed
/// as the account password and suffixes user ids.
#[must_use]
pub fn server_name(server: &str) -> &str {
    server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
}

/// The user id `server` would assign us.
fn expected_user_id(signer: &dyn Signer, server: &str) -> String {
    format!("@{}:{}", signer.address().lowercased(), server_name(server))
}

/// How an authentication attempt failed.
enum AttemptError {
    /// Server or network trouble; the same or another server may still work.
    Retry(EngineError),
    /// The session came back under a foreign identity; retrying cannot fix
    /// it and using it would impersonate someone else.
    Fatal(EngineError),
}

impl From<EngineError> for AttemptError {
    fn from(err: EngineError) -> Self {
        Self::Retry(err)
    }
}

pub struct TransportInitEpic {
    factory: Arc<dyn TransportFactory>,
    session: Session,
    signer: Arc<dyn Signer>,
}

impl TransportInitEpic {
    #[must_use]
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        session: Session,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self { factory, session, signer }
    }

    /// Candidate servers in attempt order.
    async fn candidates(
        &self,
        ctx: &EpicContext,
        config: &EngineConfig,
    ) -> Result<Vec<String>, EngineError> {
        if let Some(pinned) = &config.transport_server {
            return Ok(vec![pinned.clone()]);
        }
        if let Some(stored) = &ctx.snapshot().transport.server {
            return Ok(vec![stored.clone()]);
        }
        let listed = self.factory.fetch_server_list(&config.server_lookup).await?;
        let mut ranked = Vec::with_capacity(listed.len());
        for server in listed {
            // failed probes exclude the server from this round entirely
            match self.factory.probe(&server).await {
                Ok(rtt) => ranked.push((rtt, server)),
                Err(err) => warn!(server, %err, "server probe failed"),
            }
        }
        ranked.sort_by_key(|(rtt, _)| *rtt);
        Ok(ranked.into_iter().map(|(_, server)| server).collect())
    }

    /// One authentication attempt against `server`.
    async fn attempt(
        &self,
        ctx: &EpicContext,
        server: &str,
    ) -> Result<Arc<dyn TransportClient>, AttemptError> {
        let snapshot = ctx.snapshot();
        let stored = snapshot
            .transport
            .credentials
            .as_ref()
            .filter(|_| snapshot.transport.server.as_deref() == Some(server));

        let client = if let Some(credentials) = stored {
            debug!(server, "logging in with stored credentials");
            self.factory.login(server, credentials).await?
        } else {
            let name = server_name(server);
            let password = self
                .signer
                .sign_message(name.as_bytes())
                .map_err(|err| EngineError::Signing(err.to_string()))?;
            debug!(server, "registering fresh account");
            self.factory
                .register(
                    server,
                    &self.signer.address().lowercased(),
                    &password.to_string(),
                )
                .await?
        };

        // a session under someone else's identity must never be used
        let expected = expected_user_id(self.signer.as_ref(), server);
        if client.user_id() != expected {
            return Err(AttemptError::Fatal(EngineError::Transport(format!(
                "server assigned foreign user id {} (expected {expected})",
                client.user_id()
            ))));
        }
        Ok(client)
    }

    async fn establish(&self, ctx: &EpicContext) -> Result<(), EngineError> {
        let config = ctx.config();
        let candidates = self.candidates(ctx, &config).await?;
        if candidates.is_empty() {
            return Err(EngineError::Transport("no transport server available".to_string()));
        }

        // each candidate gets its capped retries before we move to the next
        let attempts = config.retry_count.max(1);
        let mut last_error = EngineError::Transport("no attempt made".to_string());
        for server in &candidates {
            for attempt in 0..attempts {
                if attempt > 0 {
                    sleep(config.http_timeout() / 10).await;
                }
                match self.attempt(ctx, server).await {
                    Ok(client) => {
                        self.finish(ctx, server, client).await?;
                        return Ok(());
                    }
                    Err(AttemptError::Fatal(err)) => return Err(err),
                    Err(AttemptError::Retry(err)) => {
                        warn!(server, attempt, %err, "transport attempt failed");
                        last_error = err;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Decorate the fresh session and announce it.
    async fn finish(
        &self,
        ctx: &EpicContext,
        server: &str,
        client: Arc<dyn TransportClient>,
    ) -> Result<(), EngineError> {
        let user_id = client.user_id();
        let display_name = self
            .signer
            .sign_message(user_id.as_bytes())
            .map_err(|err| EngineError::Signing(err.to_string()))?
            .to_string();
        client.set_display_name(&display_name).await?;

        let caps = ctx.config().caps.unwrap_or_default();
        client.set_capabilities(&stringify_caps(&caps)).await?;
        client.set_presence(true).await?;

        let credentials = TransportCredentials {
            user_id: user_id.clone(),
            access_token: client.access_token(),
            device_id: client.device_id(),
            display_name,
        };
        self.session.set(client);
        info!(server, user_id, "transport session established");
        ctx.dispatch(Action::TransportSetup {
            server: server.to_string(),
            credentials,
        });
        Ok(())
    }
}

#[async_trait]
impl Epic for TransportInitEpic {
    fn name(&self) -> &'static str {
        "transport_init"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Shutdown]));
        // other epics must be subscribed before the setup action fires
        ctx.wait_started().await;

        self.establish(&ctx).await?;

        while let Ok(action) = sub.recv().await {
            if let Action::Shutdown { reason } = action {
                if !reason.is_fatal() {
                    // best-effort offline signal; ignore failures on the way out
                    if let Some(client) = self.session.get() {
                        if let Err(err) = client.set_presence(false).await {
                            debug!(%err, "offline signal failed");
                        }
                    }
                }
                break;
            }
        }
        Ok(())
    }
}

/// Bounded wait for a transport session to appear, used by dependent epics.
pub async fn wait_for_session(
    ctx: &EpicContext,
    session: &Session,
) -> Result<Arc<dyn TransportClient>, EngineError> {
    let mut sub = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Transport]));
    if let Some(client) = session.get() {
        return Ok(client);
    }
    loop {
        match sub.recv().await {
            Ok(Action::TransportSetup { .. }) => return session.require(),
            Ok(Action::Shutdown { reason }) => return Err(EngineError::ShuttingDown(reason)),
            Ok(_) => continue,
            Err(_) => {
                return Err(EngineError::Transport("action stream closed".to_string()));
            }
        }
    }
}
