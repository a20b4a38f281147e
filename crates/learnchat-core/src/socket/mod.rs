//! Persistent socket connection to the chat backend
//!
//! - `packet` - Engine.IO / Socket.IO text frame codec
//! - `transport` - WebSocket connector and link tasks
//! - `registry` - per-event listener registry
//! - `manager` - connection lifecycle and reconnection

pub mod manager;
pub mod packet;
pub(crate) mod registry;
pub mod traits;
pub mod transport;

pub use manager::{ConnectionHandle, ConnectionManager};
pub use traits::{Connector, Link, OutboundFrame, SocketEvent};
pub use transport::WsConnector;
