//! HTTP client for the chat REST API
//!
//! `send_message` is the non-streaming fallback path of an exchange; the
//! remaining calls back the chat history views.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{
    ApiEnvelope, ChatHistoryBody, ChatHistoryPage, ChatRecord, OutboundMessage, SendMessageData,
};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Reason reported when a fallback send fails without a backend message
pub const SEND_FAILED: &str = "Failed to send message";

const AUTH_REQUIRED: &str = "Authentication required";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Authenticated client for the chat endpoints
pub struct ChatApi {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.api_base(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear_token(&self) {
        *self.token.write() = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    /// Endpoint under the API base; each segment is percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("API URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Attach the bearer token, failing when none is set
    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .token
            .read()
            .clone()
            .ok_or_else(|| Error::Authentication(AUTH_REQUIRED.to_string()))?;
        Ok(request.bearer_auth(token))
    }

    /// Turn a non-2xx response into `Error::Remote`
    async fn check(response: Response, default_message: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_message.to_string());

        warn!("Chat API returned {}: {}", status, message);
        Err(Error::Remote(message))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, default_message: &str) -> Result<T> {
        debug!("GET {}", url.path());
        let request = self.authorized(self.client.get(url))?;
        let response = Self::check(request.send().await?, default_message).await?;
        Ok(response.json().await?)
    }

    /// Send a message without streaming: `POST /chat/message`.
    ///
    /// Every failure other than a missing token surfaces as `Error::Remote`
    /// carrying the backend message.
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<SendMessageData> {
        let request = self
            .authorized(self.client.post(self.url(&["chat", "message"])?))?
            .json(message);

        debug!("POST /chat/message (feature {})", message.feature);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Fallback request failed: {}", e);
                return Err(Error::Remote(SEND_FAILED.to_string()));
            }
        };
        let response = Self::check(response, SEND_FAILED).await?;

        let envelope: ApiEnvelope<SendMessageData> = match response.json().await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Unreadable fallback response: {}", e);
                return Err(Error::Remote(SEND_FAILED.to_string()));
            }
        };

        match envelope.data {
            Some(data) if envelope.success => Ok(data),
            _ => Err(Error::Remote(
                envelope
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| SEND_FAILED.to_string()),
            )),
        }
    }

    /// All chats of the user: `GET /chat`
    pub async fn list_chats(&self) -> Result<Vec<ChatRecord>> {
        let body: ApiEnvelope<Vec<ChatRecord>> =
            self.get_json(self.url(&["chat"])?, "Failed to fetch chats").await?;
        Ok(body.data.unwrap_or_default())
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<ChatRecord> {
        let url = self.url(&["chat", chat_id])?;
        let body: ApiEnvelope<ChatRecord> = self.get_json(url, "Failed to fetch chat").await?;
        body.data.ok_or_else(|| {
            Error::Remote(body.message.unwrap_or_else(|| "Failed to fetch chat".to_string()))
        })
    }

    pub async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let url = self.url(&["chat", chat_id])?;
        debug!("DELETE {}", url.path());
        let request = self.authorized(self.client.delete(url))?;
        Self::check(request.send().await?, "Failed to delete chat").await?;
        Ok(())
    }

    /// Move a chat to another category; returns the updated record when the
    /// backend sends one back
    pub async fn update_chat_category(
        &self,
        chat_id: &str,
        category: &str,
    ) -> Result<Option<ChatRecord>> {
        let url = self.url(&["chat", chat_id, "category"])?;
        debug!("PUT {}", url.path());
        let request = self
            .authorized(self.client.put(url))?
            .json(&serde_json::json!({ "category": category }));
        let response = Self::check(request.send().await?, "Failed to update chat category").await?;

        let body: ApiEnvelope<ChatRecord> = response.json().await?;
        Ok(body.data)
    }

    /// One page of a feature's chat history
    pub async fn chat_history(
        &self,
        feature: &str,
        sub_feature: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<ChatHistoryPage> {
        let mut query = vec![
            ("feature", feature.to_string()),
            ("page", page.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(sub) = sub_feature {
            query.push(("subFeature", sub.to_string()));
        }

        debug!("GET /chat/chat-history ({} page {})", feature, page);
        let request = self
            .authorized(self.client.get(self.url(&["chat", "chat-history"])?))?
            .query(&query);
        let response = Self::check(request.send().await?, "Failed to fetch chat history").await?;

        let body: ChatHistoryBody = response.json().await?;
        Ok(body.into_page(page, limit))
    }
}

impl std::fmt::Debug for ChatApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatApi")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.has_token())
            .finish()
    }
}
