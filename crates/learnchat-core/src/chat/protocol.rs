//! Chat event names and payload parsing

use crate::error::{ProtocolError, Result};
use crate::types::{AiResponse, ChatInfo, ChunkUpdate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

pub const CHAT_MESSAGE: &str = "chat_message";
pub const CHAT_STARTED: &str = "chat_started";
pub const CHAT_INFO: &str = "chat_info";
pub const CHAT_CHUNK: &str = "chat_chunk";
pub const CHAT_COMPLETE_CHUNK: &str = "chat_complete_chunk";
pub const CHAT_COMPLETE: &str = "chat_complete";
pub const CHAT_ERROR: &str = "chat_error";

/// Reason reported when `chat_error` carries nothing usable
pub const DEFAULT_REMOTE_ERROR: &str = "An error occurred while processing your message";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoPayload {
    chat_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkPayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    full_content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletePayload {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(alias = "response")]
    ai_response: AiResponse,
}

/// A decoded server event of an exchange
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChatEvent {
    Started,
    Info(ChatInfo),
    Chunk {
        content: Option<String>,
        full_content: Option<String>,
    },
    Complete {
        conversation_id: Option<String>,
        final_message: AiResponse,
    },
    Error(String),
}

fn parse<T: DeserializeOwned>(event: &str, data: &Value) -> Result<T> {
    T::deserialize(data).map_err(|e| {
        ProtocolError::InvalidPayload {
            event: event.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Decode the payload of a chat event.
///
/// Returns `Ok(None)` for events that are not part of an exchange.
pub(crate) fn decode_event(name: &str, data: &Value) -> Result<Option<ChatEvent>> {
    let event = match name {
        CHAT_STARTED => ChatEvent::Started,
        CHAT_INFO => {
            let info: InfoPayload = parse(name, data)?;
            ChatEvent::Info(ChatInfo {
                conversation_id: info.chat_id,
            })
        }
        CHAT_CHUNK | CHAT_COMPLETE_CHUNK => {
            let chunk: ChunkPayload = parse(name, data)?;
            ChatEvent::Chunk {
                content: chunk.content,
                full_content: chunk.full_content,
            }
        }
        CHAT_COMPLETE => {
            let done: CompletePayload = parse(name, data)?;
            ChatEvent::Complete {
                conversation_id: done.chat_id,
                final_message: done.ai_response,
            }
        }
        CHAT_ERROR => ChatEvent::Error(error_reason(data)),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Human-readable reason carried by a `chat_error` payload
pub(crate) fn error_reason(data: &Value) -> String {
    let reason = match data {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map
            .get("error")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str),
        _ => None,
    };
    match reason {
        Some(r) if !r.trim().is_empty() => r.to_string(),
        _ => DEFAULT_REMOTE_ERROR.to_string(),
    }
}

/// Tracks the cumulative text of a chunk stream
#[derive(Debug, Default)]
pub(crate) struct ChunkAccumulator {
    cumulative: String,
}

impl ChunkAccumulator {
    /// Fold the next chunk in, rejecting a cumulative text that shrinks.
    ///
    /// Chunks without `fullContent` are appended client-side.
    pub fn push(
        &mut self,
        content: Option<String>,
        full_content: Option<String>,
    ) -> Result<ChunkUpdate> {
        let (incremental, cumulative) = match (content, full_content) {
            (content, Some(full)) => {
                let incremental = match content {
                    Some(c) => c,
                    None => full
                        .strip_prefix(self.cumulative.as_str())
                        .unwrap_or(full.as_str())
                        .to_string(),
                };
                (incremental, full)
            }
            (Some(content), None) => {
                let cumulative = format!("{}{}", self.cumulative, content);
                (content, cumulative)
            }
            (None, None) => (String::new(), self.cumulative.clone()),
        };

        let previous = self.cumulative.chars().count();
        let current = cumulative.chars().count();
        if current < previous {
            return Err(ProtocolError::ChunkRegression { previous, current }.into());
        }

        self.cumulative = cumulative.clone();
        Ok(ChunkUpdate {
            incremental_text: incremental,
            cumulative_text: cumulative,
        })
    }

    pub fn text(&self) -> &str {
        &self.cumulative
    }
}
