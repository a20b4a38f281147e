//! Stream event and connection state types

use super::AiResponse;
use serde::{Deserialize, Serialize};

/// Lifecycle state of the persistent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link and no attempt in progress
    #[default]
    Disconnected,
    /// First connection attempt for a token
    Connecting,
    /// Link established and authenticated
    Connected,
    /// Waiting for or performing a reconnection attempt
    Reconnecting,
    /// Reconnection attempts exhausted
    Failed,
}

impl ConnectionState {
    /// Status line for a connection indicator
    pub fn status_message(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "Connected - Real-time streaming enabled",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Reconnecting => {
                "Reconnecting... Will fallback to standard mode if needed"
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                "Connection lost - Using fallback mode"
            }
        }
    }

    /// Whether a connection attempt is underway
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Conversation identity assigned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfo {
    pub conversation_id: String,
}

/// One incremental piece of a streamed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUpdate {
    pub incremental_text: String,
    pub cumulative_text: String,
}

/// Which transport produced an exchange's response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeRoute {
    Streaming,
    Fallback,
}

/// Final result of a successful exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCompletion {
    pub conversation_id: Option<String>,
    pub final_message: AiResponse,
    pub route: ExchangeRoute,
}

/// Events of one exchange, in delivery order.
///
/// `Complete` and `Error` are terminal; exactly one of them ends an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Started,
    Info {
        conversation_id: String,
    },
    Chunk {
        incremental_text: String,
        cumulative_text: String,
    },
    Complete {
        final_message: AiResponse,
        conversation_id: Option<String>,
    },
    Error {
        reason: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

impl From<ChatInfo> for StreamEvent {
    fn from(info: ChatInfo) -> Self {
        StreamEvent::Info {
            conversation_id: info.conversation_id,
        }
    }
}

impl From<ChunkUpdate> for StreamEvent {
    fn from(chunk: ChunkUpdate) -> Self {
        StreamEvent::Chunk {
            incremental_text: chunk.incremental_text,
            cumulative_text: chunk.cumulative_text,
        }
    }
}

impl From<ChatCompletion> for StreamEvent {
    fn from(done: ChatCompletion) -> Self {
        StreamEvent::Complete {
            final_message: done.final_message,
            conversation_id: done.conversation_id,
        }
    }
}
