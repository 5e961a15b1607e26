//! WebSocket subsystem.
//!
//! # Data Flow
//! ```text
//! gateway.rs (ticket, upgrade, connection loop)
//!     → codec.rs (length-prefixed frames)
//!     → router.rs (subscribe / unsubscribe / load / relay)
//!         → hub.rs (connections, fan-out, teardown)
//!         → tracker.rs (topic ↔ socket indexes)
//!         → store.rs (connection records, allowances, message log)
//! ```

pub mod codec;
pub mod gateway;
pub mod hub;
pub mod router;
pub mod store;
pub mod tracker;

pub use codec::{Codec, CodecError, SocketAction, SocketMessage};
pub use gateway::{sock_handler, ticket_handler, SOCK_HANDLER_LIMITER};
pub use hub::{Connection, SocketHub, TicketError, ROLE_CALL_TOPIC};
pub use store::{DbSocketStore, MemorySocketStore, SocketStore, SocketStoreError};
pub use tracker::{Participant, TopicTracker};
