//! # Peer Data-Channel Upgrade
//!
//! Direct peer-to-peer data channels negotiated over the messaging
//! transport, used as a lower-latency path once established. Each monitored
//! peer gets its own negotiation loop, gated on presence and the webRTC
//! capability on both ends.
//!
//! ```text
//!   presence up            offer/answer over rooms          channel open
//!  ------------> negotiate -------------------------> exchange ----------+
//!        ^                                            candidates         |
//!        |                                                               v
//!        +------- retry (callee at once, caller after backoff) <---- active
//!                        hangup / timeout / peer offline
//! ```
//!
//! The session id is derived from the sorted participant addresses, so both
//! ends agree on it and on who calls without any coordination.

pub mod epic;
pub mod ice;
pub mod ports;
pub mod signals;

pub use epic::WebRtcEpic;
pub use ice::IceCache;
pub use ports::{PeerConnection, PeerConnector};
pub use signals::{
    call_id, is_caller, PeerSignal, MSG_TYPE_ANSWER, MSG_TYPE_CANDIDATES, MSG_TYPE_HANGUP,
    MSG_TYPE_OFFER,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pc_engine::EpicEngine;
    use pc_state::{EngineState, StateStore};
    use pc_transport::{Session, TransportClient, TransportEvent, TurnServers, UserInfo};
    use shared_bus::{Action, ActionBus, ActionFilter, ActionTopic};
    use shared_types::{
        Address, Caps, EngineConfig, EngineError, ShutdownReason, U256,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, watch};
    use tokio::task::JoinHandle;

    const ROOM: &str = "!direct:server";

    struct FakeClient {
        events_tx: broadcast::Sender<TransportEvent>,
        sent: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeClient {
        fn new() -> Arc<Self> {
            let (events_tx, _) = broadcast::channel(64);
            Arc::new(Self { events_tx, sent: Mutex::new(Vec::new()) })
        }

        fn push(&self, event: TransportEvent) {
            let _ = self.events_tx.send(event);
        }

        fn sent_of_type(&self, msg_type: &str) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter(|(_, t, _)| t == msg_type)
                .map(|(_, _, body)| body.clone())
                .collect()
        }
    }

    #[async_trait]
    impl TransportClient for FakeClient {
        fn user_id(&self) -> String {
            "@own:server".to_string()
        }

        fn device_id(&self) -> String {
            "DEVICE".to_string()
        }

        fn access_token(&self) -> String {
            "token".to_string()
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
            Ok(ROOM.to_string())
        }

        async fn join_room(&self, _room_id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn leave_room(&self, _room_id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn send(&self, room_id: &str, msg_type: &str, body: &str) -> Result<(), EngineError> {
            self.sent
                .lock()
                .push((room_id.to_string(), msg_type.to_string(), body.to_string()));
            Ok(())
        }

        async fn turn_servers(&self) -> Result<TurnServers, EngineError> {
            Ok(TurnServers::default())
        }

        async fn logout(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct FakeConnection {
        remote: Mutex<Vec<(String, String)>>,
        candidates: Mutex<Vec<String>>,
        local_tx: broadcast::Sender<String>,
        open_tx: watch::Sender<bool>,
        open_rx: watch::Receiver<bool>,
        incoming_tx: broadcast::Sender<String>,
        sent: Mutex<Vec<String>>,
    }

    impl FakeConnection {
        fn new() -> Arc<Self> {
            let (local_tx, _) = broadcast::channel(16);
            let (incoming_tx, _) = broadcast::channel(16);
            let (open_tx, open_rx) = watch::channel(false);
            Arc::new(Self {
                remote: Mutex::new(Vec::new()),
                candidates: Mutex::new(Vec::new()),
                local_tx,
                open_tx,
                open_rx,
                incoming_tx,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn open(&self) {
            let _ = self.open_tx.send(true);
        }
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn create_offer(&self) -> Result<String, EngineError> {
            Ok("offer-sdp".to_string())
        }

        async fn create_answer(&self) -> Result<String, EngineError> {
            Ok("answer-sdp".to_string())
        }

        async fn set_remote_description(
            &self,
            sdp_type: &str,
            sdp: &str,
        ) -> Result<(), EngineError> {
            self.remote.lock().push((sdp_type.to_string(), sdp.to_string()));
            Ok(())
        }

        async fn add_candidate(&self, candidate: &str) -> Result<(), EngineError> {
            self.candidates.lock().push(candidate.to_string());
            Ok(())
        }

        fn local_candidates(&self) -> broadcast::Receiver<String> {
            self.local_tx.subscribe()
        }

        async fn wait_open(&self) -> Result<(), EngineError> {
            let mut rx = self.open_rx.clone();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    return Err(EngineError::Transport("connection dropped".to_string()));
                }
            }
            Ok(())
        }

        fn incoming(&self) -> broadcast::Receiver<String> {
            self.incoming_tx.subscribe()
        }

        async fn send(&self, text: &str) -> Result<(), EngineError> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeConnector {
        conns: Mutex<Vec<Arc<FakeConnection>>>,
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            _turn: &TurnServers,
        ) -> Result<Arc<dyn PeerConnection>, EngineError> {
            let conn = FakeConnection::new();
            self.conns.lock().push(conn.clone());
            Ok(conn)
        }
    }

    struct Harness {
        store: Arc<StateStore>,
        handle: JoinHandle<ShutdownReason>,
        client: Arc<FakeClient>,
        connector: Arc<FakeConnector>,
    }

    async fn harness(own: [u8; 20]) -> Harness {
        let client = FakeClient::new();
        let connector = Arc::new(FakeConnector::default());
        let session = Session::new();
        session.set(client.clone());

        let store = StateStore::new(
            ActionBus::new(),
            EngineState::new(Address::new(own), U256::from(5)),
            EngineConfig {
                caps: Some(Caps { receive: true, web_rtc: true }),
                ..Default::default()
            },
        );
        let mut engine = EpicEngine::new(store.clone());
        engine.register(Arc::new(WebRtcEpic::new(session, connector.clone())));
        let handle = tokio::spawn(engine.run());
        // supervisor + latest + the manager
        while store.bus().subscriber_count() < 3 {
            tokio::task::yield_now().await;
        }
        Harness { store, handle, client, connector }
    }

    fn peer_online(peer: Address) -> Vec<Action> {
        vec![
            Action::RoomJoined { address: peer, room_id: ROOM.to_string() },
            Action::PresenceUpdate {
                address: peer,
                user_id: format!("@{}:server", peer.lowercased()),
                available: true,
                ts: 1,
                caps: Some(Caps { receive: true, web_rtc: true }),
            },
        ]
    }

    async fn wait_sent(client: &FakeClient, msg_type: &str) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(body) = client.sent_of_type(msg_type).into_iter().next() {
                    return body;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for transport send")
    }

    async fn wait_conn(connector: &FakeConnector) -> Arc<FakeConnection> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(conn) = connector.conns.lock().first() {
                    return conn.clone();
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for peer connection")
    }

    async fn wait_until(mut pred: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !pred() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for condition");
    }

    async fn wait_for(
        sub: &mut shared_bus::Subscription,
        pred: impl FnMut(&Action) -> bool,
    ) -> Action {
        tokio::time::timeout(Duration::from_secs(5), sub.find(pred))
            .await
            .expect("timed out waiting for action")
            .unwrap()
    }

    async fn stop(h: Harness) {
        h.store
            .dispatch(Action::Shutdown { reason: ShutdownReason::Stop });
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_caller_negotiates_session_and_carries_messages() {
        // own address sorts first, so this side offers
        let h = harness([0x01; 20]).await;
        let peer = Address::new([0xEE; 20]);
        let sender = format!("@{}:server", peer.lowercased());
        let mut sessions =
            h.store.subscribe(ActionFilter::topics(vec![ActionTopic::PeerSession]));
        let mut messages =
            h.store.subscribe(ActionFilter::topics(vec![ActionTopic::Messages]));

        for action in peer_online(peer) {
            h.store.dispatch(action);
        }
        let offer = wait_sent(&h.client, MSG_TYPE_OFFER).await;
        let offer = PeerSignal::decode(MSG_TYPE_OFFER, &offer).unwrap();
        let cid = offer.call_id().to_string();
        assert_eq!(cid, call_id(&Address::new([0x01; 20]), &peer));

        let conn = wait_conn(&h.connector).await;
        h.client.push(TransportEvent::Message {
            room_id: ROOM.to_string(),
            sender: sender.clone(),
            msg_type: MSG_TYPE_ANSWER.to_string(),
            body: PeerSignal::Answer { call_id: cid.clone(), sdp: "answer-sdp".into() }.body(),
            ts: 2,
        });
        h.client.push(TransportEvent::Message {
            room_id: ROOM.to_string(),
            sender,
            msg_type: MSG_TYPE_CANDIDATES.to_string(),
            body: PeerSignal::Candidates {
                call_id: cid.clone(),
                candidates: vec!["remote-cand".into()],
            }
            .body(),
            ts: 3,
        });

        // descriptions and candidates are applied before the channel opens
        wait_until(|| !conn.candidates.lock().is_empty()).await;
        assert_eq!(
            conn.remote.lock().as_slice(),
            &[("answer".to_string(), "answer-sdp".to_string())]
        );
        assert_eq!(conn.candidates.lock().as_slice(), &["remote-cand".to_string()]);

        conn.open();
        let action =
            wait_for(&mut sessions, |a| matches!(a, Action::PeerSessionActive { .. })).await;
        let Action::PeerSessionActive { address, call_id: active_cid } = action else {
            unreachable!()
        };
        assert_eq!(address, peer);
        assert_eq!(active_cid, cid);

        // a local candidate is batched and relayed
        let _ = conn.local_tx.send("local-cand".to_string());
        let body = wait_sent(&h.client, MSG_TYPE_CANDIDATES).await;
        let Some(PeerSignal::Candidates { candidates, .. }) =
            PeerSignal::decode(MSG_TYPE_CANDIDATES, &body)
        else {
            unreachable!()
        };
        assert_eq!(candidates, vec!["local-cand".to_string()]);

        // outbound goes over the data channel, inbound surfaces as received
        h.store.dispatch(Action::MessageSend {
            address: peer,
            message_id: 7,
            text: "ping".to_string(),
        });
        wait_for(&mut messages, |a| matches!(a, Action::MessageSent { message_id: 7, .. }))
            .await;
        assert_eq!(conn.sent.lock().as_slice(), &["ping".to_string()]);

        let _ = conn.incoming_tx.send("pong".to_string());
        let action =
            wait_for(&mut messages, |a| matches!(a, Action::MessageReceived { .. })).await;
        let Action::MessageReceived { text, user_id, .. } = action else { unreachable!() };
        assert_eq!(text, "pong");
        assert_eq!(user_id, None);

        stop(h).await;
    }

    #[tokio::test]
    async fn test_callee_answers_and_tears_down_on_offline() {
        // own address sorts last, so this side answers
        let h = harness([0xEE; 20]).await;
        let peer = Address::new([0x01; 20]);
        let sender = format!("@{}:server", peer.lowercased());
        let cid = call_id(&Address::new([0xEE; 20]), &peer);
        let mut sessions =
            h.store.subscribe(ActionFilter::topics(vec![ActionTopic::PeerSession]));

        for action in peer_online(peer) {
            h.store.dispatch(action);
        }
        let conn = wait_conn(&h.connector).await;
        h.client.push(TransportEvent::Message {
            room_id: ROOM.to_string(),
            sender,
            msg_type: MSG_TYPE_OFFER.to_string(),
            body: PeerSignal::Offer { call_id: cid.clone(), sdp: "offer-sdp".into() }.body(),
            ts: 2,
        });

        let answer = wait_sent(&h.client, MSG_TYPE_ANSWER).await;
        let answer = PeerSignal::decode(MSG_TYPE_ANSWER, &answer).unwrap();
        assert_eq!(answer.call_id(), cid);
        assert_eq!(
            conn.remote.lock().as_slice(),
            &[("offer".to_string(), "offer-sdp".to_string())]
        );

        conn.open();
        wait_for(&mut sessions, |a| matches!(a, Action::PeerSessionActive { .. })).await;

        // peer going offline ends the session and signals the peer
        h.store.dispatch(Action::PresenceUpdate {
            address: peer,
            user_id: format!("@{}:server", peer.lowercased()),
            available: false,
            ts: 9,
            caps: Some(Caps { receive: true, web_rtc: true }),
        });
        wait_for(&mut sessions, |a| matches!(a, Action::PeerSessionInactive { .. })).await;
        wait_sent(&h.client, MSG_TYPE_HANGUP).await;

        stop(h).await;
    }

    #[tokio::test]
    async fn test_no_negotiation_without_capability() {
        let h = harness([0x01; 20]).await;
        let peer = Address::new([0xEE; 20]);

        h.store.dispatch(Action::PresenceUpdate {
            address: peer,
            user_id: format!("@{}:server", peer.lowercased()),
            available: true,
            ts: 1,
            caps: Some(Caps { receive: true, web_rtc: false }),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.client.sent_of_type(MSG_TYPE_OFFER).is_empty());
        assert!(h.connector.conns.lock().is_empty());

        stop(h).await;
    }
}
