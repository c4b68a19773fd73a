//! Transport session slice.

use shared_bus::Action;

use crate::state::EngineState;

pub(super) fn reduce(state: &mut EngineState, action: &Action) -> bool {
    let transport = &mut state.transport;
    match action {
        Action::TransportSetup { server, credentials } => {
            // room queues belong to a server; changing servers invalidates them
            if transport.server.as_deref() != Some(server) {
                transport.rooms.clear();
            }
            let changed = transport.server.as_deref() != Some(server)
                || transport.credentials.as_ref() != Some(credentials);
            transport.server = Some(server.clone());
            transport.credentials = Some(credentials.clone());
            changed
        }
        Action::RoomJoined { address, room_id } => {
            let queue = transport.rooms.entry(*address).or_default();
            if queue.first() == Some(room_id) {
                return false;
            }
            // most recently joined room goes to the front
            queue.retain(|room| room != room_id);
            queue.insert(0, room_id.clone());
            true
        }
        Action::RoomLeft { address, room_id } => {
            let Some(queue) = transport.rooms.get_mut(address) else {
                return false;
            };
            let before = queue.len();
            queue.retain(|room| room != room_id);
            let changed = queue.len() != before;
            if queue.is_empty() {
                transport.rooms.remove(address);
            }
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{Address, TransportCredentials, U256};

    fn state() -> EngineState {
        EngineState::new(Address::new([0xAA; 20]), U256::from(5))
    }

    fn credentials(token: &str) -> TransportCredentials {
        TransportCredentials {
            user_id: "@0xaa:server.one".to_string(),
            access_token: token.to_string(),
            device_id: "ENGINE".to_string(),
            display_name: "0xsig".to_string(),
        }
    }

    #[test]
    fn test_setup_stores_session() {
        let mut state = state();
        assert!(reduce(
            &mut state,
            &Action::TransportSetup {
                server: "https://server.one".to_string(),
                credentials: credentials("t1"),
            },
        ));
        assert_eq!(state.transport.server.as_deref(), Some("https://server.one"));
        assert!(state.transport.credentials.is_some());
    }

    #[test]
    fn test_server_change_invalidates_rooms() {
        let mut state = state();
        let peer = Address::new([0x01; 20]);
        reduce(
            &mut state,
            &Action::TransportSetup {
                server: "https://server.one".to_string(),
                credentials: credentials("t1"),
            },
        );
        reduce(&mut state, &Action::RoomJoined { address: peer, room_id: "!a:one".to_string() });
        assert!(!state.transport.rooms.is_empty());

        reduce(
            &mut state,
            &Action::TransportSetup {
                server: "https://server.two".to_string(),
                credentials: credentials("t2"),
            },
        );
        assert!(state.transport.rooms.is_empty());
    }

    #[test]
    fn test_rejoined_room_moves_to_front() {
        let mut state = state();
        let peer = Address::new([0x01; 20]);
        reduce(&mut state, &Action::RoomJoined { address: peer, room_id: "!a".to_string() });
        reduce(&mut state, &Action::RoomJoined { address: peer, room_id: "!b".to_string() });
        reduce(&mut state, &Action::RoomJoined { address: peer, room_id: "!a".to_string() });
        assert_eq!(state.transport.rooms[&peer], vec!["!a", "!b"]);
    }

    #[test]
    fn test_leaving_last_room_drops_peer_entry() {
        let mut state = state();
        let peer = Address::new([0x01; 20]);
        reduce(&mut state, &Action::RoomJoined { address: peer, room_id: "!a".to_string() });
        assert!(reduce(&mut state, &Action::RoomLeft { address: peer, room_id: "!a".to_string() }));
        assert!(state.transport.rooms.get(&peer).is_none());
        assert!(!reduce(&mut state, &Action::RoomLeft { address: peer, room_id: "!a".to_string() }));
    }
}
