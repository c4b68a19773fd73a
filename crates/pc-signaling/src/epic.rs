//! # Peer Session Negotiation
//!
//! One sub-state-machine per monitored peer, gated on presence. Roles are
//! deterministic: the side whose address sorts first calls, the other
//! answers, so the two ends never both offer. Negotiation signals travel as
//! room events over the messaging transport; once the data channel opens the
//! session is advertised and carries that peer's messages until torn down.
//!
//! Teardown (hangup, close, timeout, peer going offline) always emits the
//! inactive action before any retry, so observers see at most one active
//! session per peer at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use pc_engine::{Epic, EpicContext};
use pc_transport::{address_from_user_id, ensure_room, wait_for_session};
use pc_transport::{Session, TransportClient, TransportEvent};
use shared_bus::{Action, ActionFilter, ActionTopic, MessageId};
use shared_types::{Address, EngineError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::ice::IceCache;
use crate::ports::{PeerConnection, PeerConnector};
use crate::signals::{call_id, is_caller, PeerSignal};

/// Window over which locally discovered candidates are batched before being
/// relayed to the peer.
const CANDIDATE_BATCH_WINDOW: Duration = Duration::from_millis(10);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Input routed from the manager to one peer's session task.
enum PeerInput {
    Signal(PeerSignal),
    Outbound { message_id: MessageId, text: String },
    Available(bool),
    Shutdown { fatal: bool },
}

/// How one session attempt ended.
enum SessionEnd {
    /// Engine is shutting down; the task exits.
    Shutdown,
    /// Peer went offline; wait for it to come back.
    Unavailable,
    /// Session failed or was hung up; renegotiate while the peer is online.
    Retry { backoff: bool },
}

/// Drives data-channel upgrades for every monitored peer.
pub struct WebRtcEpic {
    session: Session,
    connector: Arc<dyn PeerConnector>,
    ice: Arc<IceCache>,
}

impl WebRtcEpic {
    #[must_use]
    pub fn new(session: Session, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            session,
            connector,
            ice: Arc::new(IceCache::new()),
        }
    }
}

#[async_trait]
impl Epic for WebRtcEpic {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn run(self: Arc<Self>, ctx: EpicContext) -> Result<(), EngineError> {
        let mut sub = ctx.subscribe(ActionFilter::topics(vec![
            ActionTopic::Transport,
            ActionTopic::Messages,
            ActionTopic::PeerSession,
        ]));
        ctx.wait_started().await;
        let client = wait_for_session(&ctx, &self.session).await?;
        let mut events = client.events();

        let own = ctx.snapshot().address;
        let mut peers: HashMap<Address, mpsc::UnboundedSender<PeerInput>> = HashMap::new();
        // peers whose session announced itself active, in bus order
        let mut active: HashSet<Address> = HashSet::new();
        let mut tasks: JoinSet<Address> = JoinSet::new();

        let fatal;
        loop {
            tokio::select! {
                received = sub.recv() => {
                    match received {
                        Ok(Action::Shutdown { reason }) => {
                            fatal = reason.is_fatal();
                            break;
                        }
                        Err(_) => {
                            fatal = false;
                            break;
                        }
                        Ok(Action::PresenceUpdate { address, available, caps, .. }) => {
                            let enabled = ctx.config().caps.unwrap_or_default().web_rtc
                                && caps.is_some_and(|c| c.web_rtc);
                            let up = available && enabled;
                            if let Some(tx) = peers.get(&address) {
                                let _ = tx.send(PeerInput::Available(up));
                            } else if up {
                                let (tx, rx) = mpsc::unbounded_channel();
                                peers.insert(address, tx);
                                let session = PeerSession {
                                    ctx: ctx.clone(),
                                    client: client.clone(),
                                    connector: self.connector.clone(),
                                    ice: self.ice.clone(),
                                    peer: address,
                                    call_id: call_id(&own, &address),
                                    caller: is_caller(&own, &address),
                                };
                                tasks.spawn(session.run(rx));
                            }
                        }
                        Ok(Action::PeerSessionActive { address, .. }) => {
                            active.insert(address);
                        }
                        Ok(Action::PeerSessionInactive { address }) => {
                            active.remove(&address);
                        }
                        Ok(Action::MessageSend { address, message_id, text }) => {
                            if active.contains(&address) {
                                if let Some(tx) = peers.get(&address) {
                                    let _ = tx.send(PeerInput::Outbound { message_id, text });
                                }
                            }
                        }
                        Ok(_) => {}
                    }
                }
                event = events.recv() => {
                    let Ok(event) = event else {
                        fatal = false;
                        break;
                    };
                    let TransportEvent::Message { sender, msg_type, body, .. } = event else {
                        continue;
                    };
                    let Some(signal) = PeerSignal::decode(&msg_type, &body) else {
                        continue;
                    };
                    let Some(address) = address_from_user_id(&sender) else {
                        continue;
                    };
                    // signals for peers we are not negotiating with are dropped
                    if let Some(tx) = peers.get(&address) {
                        let _ = tx.send(PeerInput::Signal(signal));
                    }
                }
                finished = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(Ok(address)) = finished {
                        peers.remove(&address);
                    }
                }
            }
        }

        for tx in peers.values() {
            let _ = tx.send(PeerInput::Shutdown { fatal });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// The negotiation loop for one peer. Lives as long as the peer is
/// monitored; renegotiates after every teardown while the peer stays online.
struct PeerSession {
    ctx: EpicContext,
    client: Arc<dyn TransportClient>,
    connector: Arc<dyn PeerConnector>,
    ice: Arc<IceCache>,
    peer: Address,
    call_id: String,
    caller: bool,
}

impl PeerSession {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PeerInput>) -> Address {
        let mut available = true;
        loop {
            while !available {
                match rx.recv().await {
                    Some(PeerInput::Available(up)) => available = up,
                    Some(PeerInput::Shutdown { .. }) | None => return self.peer,
                    Some(_) => {}
                }
            }
            match self.attempt(&mut rx).await {
                SessionEnd::Shutdown => return self.peer,
                SessionEnd::Unavailable => available = false,
                SessionEnd::Retry { backoff } => {
                    // the caller always waits before re-offering; the callee
                    // goes straight back to listening
                    if self.caller || backoff {
                        sleep(self.ctx.config().http_timeout() / 10).await;
                    }
                }
            }
        }
    }

    /// One full negotiation attempt, through teardown.
    async fn attempt(&self, rx: &mut mpsc::UnboundedReceiver<PeerInput>) -> SessionEnd {
        let turn = self.ice.get(&self.client).await;
        let conn = match self.connector.connect(&turn).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(peer = %self.peer, %err, "peer connection setup failed");
                return SessionEnd::Retry { backoff: true };
            }
        };
        let room = match ensure_room(&self.ctx, &self.client, self.peer).await {
            Ok(room) => room,
            Err(err) => {
                warn!(peer = %self.peer, %err, "no room for signaling");
                conn.close().await;
                return SessionEnd::Retry { backoff: true };
            }
        };
        // subscribed before descriptions exist so no candidate is missed
        let cand_rx = conn.local_candidates();

        let end = self.negotiate(rx, &conn, &room).await;
        let end = match end {
            Ok(()) => self.exchange(rx, &conn, cand_rx, &room).await,
            Err(end) => end,
        };
        if matches!(end, SessionEnd::Retry { .. } | SessionEnd::Unavailable) {
            self.send_hangup(&room).await;
        }
        conn.close().await;
        end
    }

    /// Description exchange: offer out/answer in for the caller, the inverse
    /// for the callee. Candidates arriving early are buffered by `exchange`,
    /// so this phase only consumes descriptions and lifecycle inputs.
    async fn negotiate(
        &self,
        rx: &mut mpsc::UnboundedReceiver<PeerInput>,
        conn: &Arc<dyn PeerConnection>,
        room: &str,
    ) -> Result<(), SessionEnd> {
        let held;
        if self.caller {
            let sdp = conn
                .create_offer()
                .await
                .map_err(|err| self.local_failure("offer creation", err))?;
            let offer = PeerSignal::Offer { call_id: self.call_id.clone(), sdp };
            self.send_signal(room, &offer)
                .await
                .map_err(|err| self.local_failure("offer delivery", err))?;

            let deadline = Instant::now() + self.ctx.config().http_timeout();
            let (answer, buffered) = self
                .wait_signal(rx, Some(deadline), |signal| {
                    matches!(signal, PeerSignal::Answer { .. })
                })
                .await?;
            held = buffered;
            let PeerSignal::Answer { sdp, .. } = answer else {
                return Err(SessionEnd::Retry { backoff: true });
            };
            conn.set_remote_description("answer", &sdp)
                .await
                .map_err(|err| self.local_failure("answer application", err))?;
        } else {
            let (offer, buffered) = self
                .wait_signal(rx, None, |signal| matches!(signal, PeerSignal::Offer { .. }))
                .await?;
            held = buffered;
            let PeerSignal::Offer { sdp, .. } = offer else {
                return Err(SessionEnd::Retry { backoff: true });
            };
            conn.set_remote_description("offer", &sdp)
                .await
                .map_err(|err| self.local_failure("offer application", err))?;
            let sdp = conn
                .create_answer()
                .await
                .map_err(|err| self.local_failure("answer creation", err))?;
            let answer = PeerSignal::Answer { call_id: self.call_id.clone(), sdp };
            self.send_signal(room, &answer)
                .await
                .map_err(|err| self.local_failure("answer delivery", err))?;
        }
        // candidates that raced the descriptions apply only now
        for signal in held {
            if let PeerSignal::Candidates { candidates, .. } = signal {
                for candidate in candidates {
                    if let Err(err) = conn.add_candidate(&candidate).await {
                        debug!(peer = %self.peer, %err, "candidate rejected");
                    }
                }
            }
        }
        Ok(())
    }

    /// Candidate exchange until the data channel opens, then the live
    /// message loop until teardown.
    async fn exchange(
        &self,
        rx: &mut mpsc::UnboundedReceiver<PeerInput>,
        conn: &Arc<dyn PeerConnection>,
        mut cand_rx: tokio::sync::broadcast::Receiver<String>,
        room: &str,
    ) -> SessionEnd {
        let open_deadline = Instant::now() + self.ctx.config().http_timeout() / 3;
        loop {
            tokio::select! {
                opened = conn.wait_open() => {
                    match opened {
                        Ok(()) => break,
                        Err(err) => {
                            warn!(peer = %self.peer, %err, "data channel failed to open");
                            return SessionEnd::Retry { backoff: true };
                        }
                    }
                }
                () = sleep_until(open_deadline) => {
                    debug!(peer = %self.peer, "data channel open timed out");
                    return SessionEnd::Retry { backoff: true };
                }
                candidate = cand_rx.recv() => {
                    let Ok(candidate) = candidate else { continue };
                    self.relay_candidates(&mut cand_rx, candidate, room).await;
                }
                input = rx.recv() => {
                    match self.handle_input(conn, input).await {
                        Some(end) => return end,
                        None => {}
                    }
                }
            }
        }

        info!(peer = %self.peer, call_id = self.call_id, "peer data channel live");
        self.ctx.dispatch(Action::PeerSessionActive {
            address: self.peer,
            call_id: self.call_id.clone(),
        });
        let mut incoming = conn.incoming();
        let end = loop {
            tokio::select! {
                message = incoming.recv() => {
                    match message {
                        Ok(text) => self.ctx.dispatch(Action::MessageReceived {
                            address: self.peer,
                            text,
                            ts: now_ms(),
                            user_id: None,
                        }),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break SessionEnd::Retry { backoff: true },
                    }
                }
                candidate = cand_rx.recv() => {
                    let Ok(candidate) = candidate else { continue };
                    self.relay_candidates(&mut cand_rx, candidate, room).await;
                }
                input = rx.recv() => {
                    if let Some(PeerInput::Outbound { message_id, text }) = &input {
                        match conn.send(text).await {
                            Ok(()) => self.ctx.dispatch(Action::MessageSent {
                                address: self.peer,
                                message_id: *message_id,
                            }),
                            Err(err) => {
                                warn!(peer = %self.peer, message_id, %err, "data channel send failed");
                            }
                        }
                        continue;
                    }
                    match self.handle_input(conn, input).await {
                        Some(end) => break end,
                        None => {}
                    }
                }
            }
        };
        self.ctx
            .dispatch(Action::PeerSessionInactive { address: self.peer });
        end
    }

    /// Shared handling of lifecycle inputs; `Some` ends the attempt.
    async fn handle_input(
        &self,
        conn: &Arc<dyn PeerConnection>,
        input: Option<PeerInput>,
    ) -> Option<SessionEnd> {
        match input {
            None => Some(SessionEnd::Shutdown),
            Some(PeerInput::Shutdown { fatal }) => {
                if !fatal {
                    self.hangup_on_shutdown().await;
                }
                Some(SessionEnd::Shutdown)
            }
            Some(PeerInput::Available(false)) => Some(SessionEnd::Unavailable),
            Some(PeerInput::Available(true)) => None,
            Some(PeerInput::Signal(signal)) => {
                if signal.call_id() != self.call_id {
                    return None;
                }
                match signal {
                    PeerSignal::Hangup { .. } => Some(SessionEnd::Retry { backoff: true }),
                    PeerSignal::Candidates { candidates, .. } => {
                        for candidate in candidates {
                            // per-candidate failures are not fatal to the session
                            if let Err(err) = conn.add_candidate(&candidate).await {
                                debug!(peer = %self.peer, %err, "candidate rejected");
                            }
                        }
                        None
                    }
                    PeerSignal::Offer { .. } | PeerSignal::Answer { .. } => None,
                }
            }
            Some(PeerInput::Outbound { message_id, .. }) => {
                debug!(peer = %self.peer, message_id, "message for inactive session dropped");
                None
            }
        }
    }

    /// Wait for a matching signal, buffering other same-call signals
    /// (candidates racing the descriptions) for the caller to apply later.
    async fn wait_signal(
        &self,
        rx: &mut mpsc::UnboundedReceiver<PeerInput>,
        deadline: Option<Instant>,
        mut pred: impl FnMut(&PeerSignal) -> bool,
    ) -> Result<(PeerSignal, Vec<PeerSignal>), SessionEnd> {
        let mut buffered: Vec<PeerSignal> = Vec::new();
        loop {
            let input = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(input) => input,
                    Err(_) => return Err(SessionEnd::Retry { backoff: true }),
                },
                None => rx.recv().await,
            };
            match input {
                None => return Err(SessionEnd::Shutdown),
                Some(PeerInput::Shutdown { fatal }) => {
                    if !fatal {
                        self.hangup_on_shutdown().await;
                    }
                    return Err(SessionEnd::Shutdown);
                }
                Some(PeerInput::Available(false)) => return Err(SessionEnd::Unavailable),
                Some(PeerInput::Signal(signal)) if signal.call_id() == self.call_id => {
                    if pred(&signal) {
                        return Ok((signal, buffered));
                    }
                    if matches!(signal, PeerSignal::Hangup { .. }) {
                        return Err(SessionEnd::Retry { backoff: true });
                    }
                    buffered.push(signal);
                }
                Some(_) => {}
            }
        }
    }

    /// Batch locally discovered candidates over a short window and relay
    /// them as one signal.
    async fn relay_candidates(
        &self,
        cand_rx: &mut tokio::sync::broadcast::Receiver<String>,
        first: String,
        room: &str,
    ) {
        let mut batch = vec![first];
        while let Ok(Ok(candidate)) = timeout(CANDIDATE_BATCH_WINDOW, cand_rx.recv()).await {
            batch.push(candidate);
        }
        let signal = PeerSignal::Candidates {
            call_id: self.call_id.clone(),
            candidates: batch,
        };
        if let Err(err) = self.send_signal(room, &signal).await {
            debug!(peer = %self.peer, %err, "candidate relay failed");
        }
    }

    async fn send_signal(&self, room: &str, signal: &PeerSignal) -> Result<(), EngineError> {
        self.client.send(room, signal.msg_type(), &signal.body()).await
    }

    /// Best-effort hangup to the peer over whatever room is known.
    async fn send_hangup(&self, room: &str) {
        let hangup = PeerSignal::Hangup { call_id: self.call_id.clone() };
        if let Err(err) = self.send_signal(room, &hangup).await {
            debug!(peer = %self.peer, %err, "hangup delivery failed");
        }
    }

    /// Hangup on shutdown is bounded by a short timeout and skipped entirely
    /// for fatal teardowns.
    async fn hangup_on_shutdown(&self) {
        let rooms = self.ctx.snapshot();
        let Some(room) = rooms
            .transport
            .rooms
            .get(&self.peer)
            .and_then(|rooms| rooms.first())
        else {
            return;
        };
        let bound = self.ctx.config().http_timeout() / 10;
        let _ = timeout(bound, self.send_hangup(room)).await;
    }

    fn local_failure(&self, what: &str, err: EngineError) -> SessionEnd {
        warn!(peer = %self.peer, %err, "{what} failed");
        SessionEnd::Retry { backoff: true }
    }
}
