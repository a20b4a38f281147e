//! LearnChat Core Library
//!
//! Client side of the LearnChat streaming chat backend:
//! - Persistent Socket.IO connection with reconnection and backoff
//! - Streamed message exchanges with an HTTP fallback
//! - Chat history REST calls and a transcript view model
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     learnchat-core                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  chat/         - Client, exchanges, REST API, transcript    │
//! │  socket/       - Socket.IO codec, link, connection manager  │
//! │  types/        - Shared type definitions                    │
//! │  config.rs     - Endpoints and reconnection policy          │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod socket;
pub mod types;

// Re-export commonly used types
pub use error::{ConnectionError, Error, ProtocolError, Result};
pub use types::*;

pub use chat::{
    ChatApi, ChatClient, Conversation, ExchangeCallbacks, ExchangeHandle, ExchangeOutcome,
    TranscriptEntry,
};
pub use config::{ClientConfig, ReconnectPolicy};
pub use socket::{ConnectionHandle, ConnectionManager, Connector, WsConnector};
