//! # Peer Presence
//!
//! Resolves addresses to transport users and follows their availability.
//! A directory hit only counts if the user's display name is a valid
//! signature of their user id by the claimed address; anyone can register
//! a lookalike localpart, the signature is what binds it to the key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pc_engine::{Epic, EpicContext};
use shared_bus::{Action, ActionFilter, ActionTopic};
use shared_crypto::recover_signer;
use shared_types::{Address, Caps, EngineError};
use tracing::{debug, warn};

use crate::caps::parse_caps;
use crate::init::wait_for_session;
use crate::ports::{Session, TransportClient, TransportEvent, UserInfo, UserPresence};

/// Whether `user` is provably operated by `address`.
#[must_use]
pub fn validate_user(address: &Address, user: &UserInfo) -> bool {
    let Some(display_name) = &user.display_name else {
        return false;
    };
    let Ok(signature) = display_name.parse() else {
        return false;
    };
    recover_signer(user.user_id.as_bytes(), &signature)
        .map(|signer| signer == *address)
        .unwrap_or(false)
}

struct TrackedPeer {
    user_id: String,
    caps: Option<Caps>,
    last_ts: u64,
}

pub struct PresenceEpic {
    session: Session,
}

impl PresenceEpic {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    async fn resolve(
        &self,
        client: &Arc<dyn TransportClient>,
        address: Address,
    ) -> Result<(String, Option<Caps>, UserPresence), EngineError> {
        let candidates = client.search_users(&address.lowercased()).await?;
        let valid = candidates
            .into_iter()
            .find(|user| validate_user(&address, user))
            .ok_or_else(|| {
                EngineError::Transport(format!("no verifiable transport user for {address}"))
            })?;
        client.track_presence(&valid.user_id).await?;
        let presence = client.presence_status(&valid.user_id).await?;
        let caps = valid.capabilities.as_deref().map(parse_caps);
        Ok((valid.user_id, caps, presence))
    }
}

#[async_trait]
impl Epic for PresenceEpic {
    fn name(&self) -> &'static str {
        "presence"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Transport]));
        ctx.wait_started().await;
        let client = wait_for_session(&ctx, &self.session).await?;
        let mut events = client.events();

        let mut tracked: HashMap<Address, TrackedPeer> = HashMap::new();
        loop {
            tokio::select! {
                received = sub.recv() => {
                    let address = match received {
                        Ok(Action::Shutdown { .. }) | Err(_) => break,
                        Ok(Action::PresenceRequest { address }) => address,
                        Ok(_) => continue,
                    };
                    if tracked.contains_key(&address) {
                        continue;
                    }
                    match self.resolve(&client, address).await {
                        Ok((user_id, caps, presence)) => {
                            debug!(%address, user_id, "presence tracking started");
                            tracked.insert(
                                address,
                                TrackedPeer {
                                    user_id: user_id.clone(),
                                    caps,
                                    last_ts: presence.ts,
                                },
                            );
                            // first update doubles as the request's success
                            // and reports the server's current view
                            ctx.dispatch(Action::PresenceUpdate {
                                address,
                                user_id,
                                available: presence.available,
                                ts: presence.ts,
                                caps,
                            });
                        }
                        Err(error) => {
                            warn!(%address, %error, "presence resolution failed");
                            ctx.dispatch(Action::PresenceFailure { address, error });
                        }
                    }
                }
                event = events.recv() => {
                    let Ok(TransportEvent::Presence { user_id, available, ts }) = event else {
                        if event.is_err() {
                            break;
                        }
                        continue;
                    };
                    let Some((address, peer)) = tracked
                        .iter_mut()
                        .find(|(_, peer)| peer.user_id == user_id)
                        .map(|(address, peer)| (*address, peer))
                    else {
                        continue;
                    };
                    // out-of-order events must not flip availability back
                    if ts <= peer.last_ts {
                        continue;
                    }
                    peer.last_ts = ts;
                    ctx.dispatch(Action::PresenceUpdate {
                        address,
                        user_id,
                        available,
                        ts,
                        caps: peer.caps,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_crypto::{LocalSigner, Signer};

    fn signed_user(signer: &LocalSigner, server: &str) -> UserInfo {
        let user_id = format!("@{}:{server}", signer.address().lowercased());
        let display_name = signer.sign_message(user_id.as_bytes()).unwrap().to_string();
        UserInfo { user_id, display_name: Some(display_name), capabilities: None }
    }

    #[test]
    fn test_valid_signature_accepted() {
        let signer = LocalSigner::random();
        let user = signed_user(&signer, "server.one");
        assert!(validate_user(&signer.address(), &user));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let signer = LocalSigner::random();
        let imposter = LocalSigner::random();
        // imposter registered the victim's localpart but signs with its key
        let victim_localpart = signer.address().lowercased();
        let user_id = format!("@{victim_localpart}:server.one");
        let display_name = imposter.sign_message(user_id.as_bytes()).unwrap().to_string();
        let user = UserInfo { user_id, display_name: Some(display_name), capabilities: None };
        assert!(!validate_user(&signer.address(), &user));
    }

    #[test]
    fn test_missing_or_garbage_display_name_rejected() {
        let signer = LocalSigner::random();
        let mut user = signed_user(&signer, "server.one");
        user.display_name = None;
        assert!(!validate_user(&signer.address(), &user));
        user.display_name = Some("not a signature".to_string());
        assert!(!validate_user(&signer.address(), &user));
    }
}
