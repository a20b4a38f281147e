//! Chat request and REST record types

use serde::{Deserialize, Serialize};

/// Default AI provider used when the caller does not choose one
pub const DEFAULT_PROVIDER: &str = "deepseek";

/// Default model used when the caller does not choose one
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// A single user message sent to the chat backend.
///
/// The same body is used for the socket `chat_message` event and for the
/// `POST /chat/message` fallback request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub content: String,
    #[serde(rename = "chatId", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(rename = "aiProvider")]
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_context: Option<String>,
    pub feature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_feature: Option<String>,
}

impl OutboundMessage {
    pub fn new(content: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            conversation_id: None,
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_context: None,
            feature: feature.into(),
            sub_feature: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = provider.into();
        self.model = model.into();
        self
    }

    pub fn with_system_context(mut self, context: impl Into<String>) -> Self {
        self.system_context = Some(context.into());
        self
    }

    pub fn with_sub_feature(mut self, sub_feature: impl Into<String>) -> Self {
        self.sub_feature = Some(sub_feature.into());
        self
    }
}

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[default]
    Assistant,
    System,
}

/// The AI message produced for an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiResponse {
    #[serde(default)]
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
}

impl AiResponse {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A message stored in a chat record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(chrono::Utc::now()),
        }
    }
}

/// A persisted conversation as returned by the REST API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub feature: Option<String>,
    #[serde(default)]
    pub sub_feature: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ChatRecord {
    /// Title shown in history lists.
    ///
    /// Falls back to the last user message when the chat still carries the
    /// placeholder title.
    pub fn display_title(&self) -> String {
        match self.title.as_deref() {
            Some(title) if !title.is_empty() && title != "New Chat" => title.to_string(),
            _ => self.last_user_message_preview(),
        }
    }

    /// Cleaned preview of the last user message, truncated to 60 characters
    pub fn last_user_message_preview(&self) -> String {
        let Some(last) = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
        else {
            return "No messages".to_string();
        };

        let clean = crate::chat::display::extract_user_content(&last.content);
        if clean.chars().count() > 60 {
            let head: String = clean.chars().take(60).collect();
            format!("{}...", head)
        } else {
            clean
        }
    }

    /// Number of user and assistant messages
    pub fn visible_message_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .count()
    }
}

/// Standard `{ success, data, message }` envelope used by the backend
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of a successful `POST /chat/message`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    pub chat: ChatRecord,
    pub ai_response: AiResponse,
}

/// One page of feature-scoped chat history
#[derive(Debug, Clone, PartialEq)]
pub struct ChatHistoryPage {
    pub chats: Vec<ChatRecord>,
    pub page: u32,
    pub total_pages: u32,
}

/// Raw body of `GET /chat/chat-history`; the backend has shipped a few shapes
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChatHistoryBody {
    #[serde(default)]
    pub data: Option<Vec<ChatRecord>>,
    #[serde(default)]
    pub chats: Option<Vec<ChatRecord>>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub total_count: Option<u32>,
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ChatHistoryBody {
    pub(crate) fn into_page(self, page: u32, limit: u32) -> ChatHistoryPage {
        let total_pages = match self.total_pages {
            Some(pages) => pages,
            None => {
                let total = self.total_count.or(self.total).unwrap_or(0);
                if limit == 0 {
                    0
                } else {
                    total.div_ceil(limit)
                }
            }
        };

        ChatHistoryPage {
            chats: self.data.or(self.chats).unwrap_or_default(),
            page,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_outbound_message_wire_shape() {
        let msg = OutboundMessage::new("Explain recursion", "study-tools")
            .with_sub_feature("explain")
            .with_conversation("c1");

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "content": "Explain recursion",
                "chatId": "c1",
                "aiProvider": "deepseek",
                "model": "deepseek-chat",
                "feature": "study-tools",
                "subFeature": "explain"
            })
        );
    }

    #[test]
    fn test_outbound_message_omits_absent_optionals() {
        let json = serde_json::to_value(OutboundMessage::new("hi", "general")).unwrap();
        assert!(json.get("chatId").is_none());
        assert!(json.get("systemContext").is_none());
        assert!(json.get("subFeature").is_none());
    }

    #[test]
    fn test_chat_record_display_title() {
        let mut record: ChatRecord = serde_json::from_value(serde_json::json!({
            "_id": "c1",
            "title": "New Chat",
            "messages": [
                { "role": "system", "content": "You are a tutor." },
                { "role": "user", "content": "Summarize the following: photosynthesis in plants" },
                { "role": "assistant", "content": "Plants convert light..." }
            ]
        }))
        .unwrap();

        assert_eq!(record.display_title(), "photosynthesis in plants");
        assert_eq!(record.visible_message_count(), 2);

        record.title = Some("Biology".into());
        assert_eq!(record.display_title(), "Biology");
    }

    #[test]
    fn test_chat_record_preview_truncates() {
        let long = "x".repeat(80);
        let record = ChatRecord {
            id: "c2".into(),
            title: None,
            feature: None,
            sub_feature: None,
            category: None,
            messages: vec![ChatMessage::new(MessageRole::User, long)],
            created_at: None,
            updated_at: None,
        };

        let preview = record.display_title();
        assert_eq!(preview.chars().count(), 63);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_chat_record_without_user_messages() {
        let record: ChatRecord = serde_json::from_value(serde_json::json!({ "_id": "c3" })).unwrap();
        assert_eq!(record.display_title(), "No messages");
    }

    #[test]
    fn test_history_body_total_pages_fallback() {
        let body: ChatHistoryBody = serde_json::from_value(serde_json::json!({
            "success": true,
            "chats": [{ "_id": "a" }, { "_id": "b" }],
            "totalCount": 41
        }))
        .unwrap();

        let page = body.into_page(1, 20);
        assert_eq!(page.chats.len(), 2);
        assert_eq!(page.total_pages, 3);
    }
}
