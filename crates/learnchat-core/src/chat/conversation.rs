//! Conversation view model
//!
//! Keeps the transcript a chat screen renders and folds an exchange's
//! `StreamEvent`s into it.

use super::display::extract_user_content;
use crate::types::{ChatMessage, MessageRole, OutboundMessage, StreamEvent, DEFAULT_MODEL, DEFAULT_PROVIDER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as shown in the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Assistant placeholder still receiving chunks
    pub streaming: bool,
}

impl TranscriptEntry {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            streaming: false,
        }
    }
}

/// State of one chat screen for a feature
#[derive(Debug, Clone)]
pub struct Conversation {
    feature: String,
    sub_feature: Option<String>,
    provider: String,
    model: String,
    conversation_id: Option<String>,
    entries: Vec<TranscriptEntry>,
    progress: u8,
    streaming: bool,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            sub_feature: None,
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            conversation_id: None,
            entries: Vec::new(),
            progress: 0,
            streaming: false,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_sub_feature(mut self, sub_feature: impl Into<String>) -> Self {
        self.sub_feature = Some(sub_feature.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = provider.into();
        self.model = model.into();
        self
    }

    /// Continue an existing backend conversation
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Streaming progress estimate, 0 to 100
    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Start an exchange: show the user's text, add an empty assistant
    /// placeholder and build the request.
    ///
    /// The system context is only sent for a new conversation or an empty
    /// transcript.
    pub fn begin_exchange(&mut self, text: &str, system_context: Option<&str>) -> OutboundMessage {
        let needs_context = self.conversation_id.is_none() || self.entries.is_empty();

        self.entries
            .push(TranscriptEntry::new(MessageRole::User, extract_user_content(text)));
        self.entries.push(TranscriptEntry {
            streaming: true,
            ..TranscriptEntry::new(MessageRole::Assistant, "")
        });
        self.error = None;
        self.streaming = true;
        self.progress = 0;
        self.updated_at = Utc::now();

        let mut message = OutboundMessage::new(text, self.feature.clone())
            .with_provider(self.provider.clone(), self.model.clone());
        if let Some(id) = &self.conversation_id {
            message = message.with_conversation(id.clone());
        }
        if let Some(sub) = &self.sub_feature {
            message = message.with_sub_feature(sub.clone());
        }
        if needs_context {
            if let Some(context) = system_context {
                message = message.with_system_context(context);
            }
        }
        message
    }

    /// Fold one event of the running exchange into the transcript
    pub fn apply(&mut self, event: &StreamEvent) {
        self.updated_at = Utc::now();

        match event {
            StreamEvent::Started => {
                self.progress = 5;
            }

            StreamEvent::Info { conversation_id } => {
                self.conversation_id = Some(conversation_id.clone());
                self.progress = 10;
            }

            StreamEvent::Chunk {
                cumulative_text, ..
            } => {
                let estimate = 10 + cumulative_text.chars().count() / 10;
                self.progress = estimate.min(90) as u8;
                if let Some(placeholder) = self.placeholder_mut() {
                    placeholder.content = cumulative_text.clone();
                }
            }

            StreamEvent::Complete {
                final_message,
                conversation_id,
            } => {
                if let Some(id) = conversation_id {
                    self.conversation_id = Some(id.clone());
                }
                match self.placeholder_mut() {
                    Some(placeholder) => {
                        placeholder.content = final_message.content.clone();
                        placeholder.streaming = false;
                    }
                    None => self.entries.push(TranscriptEntry::new(
                        MessageRole::Assistant,
                        final_message.content.clone(),
                    )),
                }
                self.finish();
            }

            StreamEvent::Error { reason } => {
                self.entries.retain(|e| !e.streaming);
                self.error = Some(reason.clone());
                self.finish();
            }
        }
    }

    /// Replace the transcript with a stored chat's messages
    pub fn load_history(&mut self, messages: &[ChatMessage]) {
        self.entries = messages
            .iter()
            .map(|m| TranscriptEntry {
                role: m.role,
                content: match m.role {
                    MessageRole::User => extract_user_content(&m.content),
                    _ => m.content.clone(),
                },
                timestamp: m.timestamp.unwrap_or_else(Utc::now),
                streaming: false,
            })
            .collect();
        self.finish();
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Start over with a new conversation
    pub fn reset(&mut self) {
        self.conversation_id = None;
        self.entries.clear();
        self.error = None;
        self.finish();
    }

    fn placeholder_mut(&mut self) -> Option<&mut TranscriptEntry> {
        self.entries.iter_mut().rev().find(|e| e.streaming)
    }

    fn finish(&mut self) {
        self.streaming = false;
        self.progress = 0;
    }
}
