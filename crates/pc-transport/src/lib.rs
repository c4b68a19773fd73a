//! # Federated Transport
//!
//! Off-chain messaging over a federation of homeservers. The init epic picks
//! a server and authenticates, the presence epic binds peer addresses to
//! verified transport users, and the messaging epic delivers queued text
//! through direct rooms.
//!
//! ```text
//!                 +----------------+
//!   server list   | TransportInit  |  register/login, identity check
//!  ------------>  |     epic       |---> Session + TransportSetup
//!                 +----------------+
//!                          |
//!            +-------------+-------------+
//!            v                           v
//!   +----------------+         +----------------+
//!   | Presence epic  |         | Messaging epic |
//!   | directory find |         | room per peer, |
//!   | sig validation |         | retried sends  |
//!   +----------------+         +----------------+
//! ```
//!
//! All account material derives from the signing key: the password signs the
//! server name, the display name signs the assigned user id, and peers are
//! only trusted when their display name verifies against their address.

pub mod caps;
pub mod init;
pub mod messages;
pub mod ports;
pub mod presence;

pub use caps::{parse_caps, stringify_caps};
pub use init::{server_name, wait_for_session, TransportInitEpic};
pub use messages::{
    address_from_user_id, ensure_room, peer_user_id, MessagingEpic, MSG_TYPE_TEXT,
};
pub use ports::{
    Session, TransportClient, TransportEvent, TransportFactory, TurnServers, UserInfo,
    UserPresence,
};
pub use presence::{validate_user, PresenceEpic};
