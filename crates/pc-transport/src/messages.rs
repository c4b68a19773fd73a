//! # Room Messaging
//!
//! Delivers queued text messages through the federated transport and turns
//! inbound room traffic into actions. Peers with an active direct data
//! channel are skipped here; the signaling layer delivers to those.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pc_engine::{Epic, EpicContext};
use shared_bus::{Action, ActionFilter, ActionTopic, MessageId};
use shared_types::{Address, EngineError};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::init::wait_for_session;
use crate::ports::{Session, TransportClient, TransportEvent};

/// Event type for plain text room messages.
pub const MSG_TYPE_TEXT: &str = "m.text";

/// The address encoded in a user id's localpart, `@0x<addr>:<server>`.
#[must_use]
pub fn address_from_user_id(user_id: &str) -> Option<Address> {
    let localpart = user_id.strip_prefix('@')?.split(':').next()?;
    localpart.parse().ok()
}

/// The peer's transport user id, requesting presence resolution if it is
/// not known yet.
pub async fn peer_user_id(ctx: &EpicContext, address: Address) -> Result<String, EngineError> {
    if let Some(presence) = ctx.latest().presence.get(&address) {
        return Ok(presence.user_id.clone());
    }
    let mut sub = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Transport]).peer(address));
    ctx.dispatch(Action::PresenceRequest { address });
    let resolved = timeout(
        ctx.config().http_timeout(),
        sub.find(|action| {
            matches!(
                action,
                Action::PresenceUpdate { .. } | Action::PresenceFailure { .. }
            )
        }),
    )
    .await
    .map_err(|_| EngineError::Timeout("presence resolution".to_string()))?;
    match resolved {
        Ok(Action::PresenceUpdate { user_id, .. }) => Ok(user_id),
        Ok(Action::PresenceFailure { error, .. }) => Err(error),
        Ok(Action::Shutdown { reason }) => Err(EngineError::ShuttingDown(reason)),
        _ => Err(EngineError::Transport("action stream closed".to_string())),
    }
}

/// The room to talk to `address` in, opening a fresh direct room when none
/// is known yet.
pub async fn ensure_room(
    ctx: &EpicContext,
    client: &Arc<dyn TransportClient>,
    address: Address,
) -> Result<String, EngineError> {
    if let Some(room_id) = ctx
        .snapshot()
        .transport
        .rooms
        .get(&address)
        .and_then(|rooms| rooms.first())
    {
        return Ok(room_id.clone());
    }
    let user_id = peer_user_id(ctx, address).await?;
    let room_id = client.open_room(&user_id).await?;
    ctx.dispatch(Action::RoomJoined { address, room_id: room_id.clone() });
    Ok(room_id)
}

pub struct MessagingEpic {
    session: Session,
}

impl MessagingEpic {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    async fn deliver(
        &self,
        ctx: &EpicContext,
        client: &Arc<dyn TransportClient>,
        address: Address,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), EngineError> {
        let room_id = ensure_room(ctx, client, address).await?;
        let config = ctx.config();
        let backoff = config.http_timeout() / 10;
        let mut last_error = EngineError::Transport("no attempt made".to_string());
        for attempt in 0..config.retry_count.max(1) {
            if attempt > 0 {
                sleep(backoff).await;
            }
            match client.send(&room_id, MSG_TYPE_TEXT, text).await {
                Ok(()) => {
                    ctx.dispatch(Action::MessageSent { address, message_id });
                    return Ok(());
                }
                Err(err) => {
                    debug!(%address, message_id, attempt, %err, "message send failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn handle_event(&self, ctx: &EpicContext, event: TransportEvent) -> Option<RoomJoin> {
        match event {
            TransportEvent::Message { sender, msg_type, body, ts, .. } => {
                if msg_type != MSG_TYPE_TEXT {
                    return None;
                }
                let Some(address) = address_from_user_id(&sender) else {
                    debug!(sender, "message from unparseable user id dropped");
                    return None;
                };
                ctx.dispatch(Action::MessageReceived {
                    address,
                    text: body,
                    ts,
                    user_id: Some(sender),
                });
                None
            }
            TransportEvent::Invite { room_id, sender } => {
                let Some(address) = address_from_user_id(&sender) else {
                    debug!(sender, "invite from unparseable user id dropped");
                    return None;
                };
                Some(RoomJoin { address, room_id })
            }
            TransportEvent::Presence { .. } => None,
        }
    }
}

struct RoomJoin {
    address: Address,
    room_id: String,
}

#[async_trait]
impl Epic for MessagingEpic {
    fn name(&self) -> &'static str {
        "messaging"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(ActionFilter::topics(vec![ActionTopic::Messages]));
        ctx.wait_started().await;
        let client = wait_for_session(&ctx, &self.session).await?;
        let mut events = client.events();

        loop {
            tokio::select! {
                received = sub.recv() => {
                    let (address, message_id, text) = match received {
                        Ok(Action::Shutdown { .. }) | Err(_) => break,
                        Ok(Action::MessageSend { address, message_id, text }) => {
                            (address, message_id, text)
                        }
                        Ok(_) => continue,
                    };
                    // direct data channels take precedence over rooms
                    if ctx.latest().has_peer_session(&address) {
                        continue;
                    }
                    if let Err(err) = self.deliver(&ctx, &client, address, message_id, &text).await
                    {
                        warn!(%address, message_id, %err, "message delivery failed");
                    }
                }
                event = events.recv() => {
                    let Ok(event) = event else { break };
                    if let Some(RoomJoin { address, room_id }) = self.handle_event(&ctx, event) {
                        match client.join_room(&room_id).await {
                            Ok(()) => ctx.dispatch(Action::RoomJoined { address, room_id }),
                            Err(err) => warn!(%address, room_id, %err, "room join failed"),
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_user_id() {
        let user_id = "@0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa:server.one";
        assert_eq!(
            address_from_user_id(user_id),
            Some(Address::new([0xAA; 20]))
        );
        assert_eq!(address_from_user_id("not a user id"), None);
        assert_eq!(address_from_user_id("@garbage:server.one"), None);
    }
}
