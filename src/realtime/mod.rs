//! Realtime chat relay: connection registry, per-connection pumps and
//! frame routing.

pub mod connection;
pub mod hub;
pub mod protocol;
pub mod router;

pub use connection::{ClientConnection, ConnectionActor, ConnectionSettings};
pub use hub::{Connection, Hub};
pub use protocol::{InboundFrame, MessageView, OutboundFrame};
pub use router::MessageRouter;
