//! Chat client: one authenticated session with the backend

use super::exchange::{Exchange, ExchangeCallbacks, ExchangeHandle, InFlight};
use super::fallback::ChatApi;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::socket::{ConnectionHandle, ConnectionManager};
use crate::types::{ConnectionState, OutboundMessage, StreamEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Sends messages over the socket, falling back to HTTP when it is down
#[derive(Debug, Clone)]
pub struct ChatClient {
    connection: ConnectionManager,
    api: Arc<ChatApi>,
    busy: Arc<AtomicBool>,
}

impl ChatClient {
    pub fn new(connection: ConnectionManager, api: ChatApi) -> Self {
        Self {
            connection,
            api: Arc::new(api),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(
            ConnectionManager::from_config(config)?,
            ChatApi::from_config(config)?,
        ))
    }

    /// Log in: open the socket and authorize REST calls with the same token
    pub async fn connect(&self, token: &str) -> Result<ConnectionHandle> {
        let handle = self.connection.connect(token).await?;
        self.api.set_token(token.trim());
        Ok(handle)
    }

    /// Log out; a running exchange ends without callbacks
    pub fn disconnect(&self) {
        self.connection.disconnect();
        self.api.clear_token();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Whether an exchange is running
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// REST API sharing this client's credential
    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    /// Start an exchange; returns at once.
    ///
    /// Fails with `Error::ExchangeInFlight` while another exchange of this
    /// client is running.
    pub fn send(
        &self,
        message: OutboundMessage,
        callbacks: ExchangeCallbacks,
    ) -> Result<ExchangeHandle> {
        let in_flight = InFlight::acquire(&self.busy).ok_or(Error::ExchangeInFlight)?;
        let exchange = Exchange::new(self.connection.clone(), Arc::clone(&self.api), message);
        let handle = exchange.spawn(callbacks, in_flight);
        debug!("Exchange {} queued", handle.id());
        Ok(handle)
    }

    /// Start an exchange whose events arrive on a channel.
    ///
    /// The channel closes once the exchange has ended.
    pub fn send_stream(
        &self,
        message: OutboundMessage,
    ) -> Result<(ExchangeHandle, mpsc::UnboundedReceiver<StreamEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.send(message, ExchangeCallbacks::forward_to(tx))?;
        Ok((handle, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::exchange::ExchangeOutcome;
    use crate::chat::Conversation;
    use crate::config::ReconnectPolicy;
    use crate::error::{ConnectionError, ProtocolError};
    use crate::socket::traits::memory::{self, ServerSide};
    use crate::socket::traits::MockConnector;
    use crate::types::{AiResponse, ExchangeRoute};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ANSWER: &str = "Recursion is when a function calls itself.";

    fn no_retry() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
            settle_window_ms: 100,
            auto_reconnect: false,
        }
    }

    /// Client backed by in-memory links; each connect pushes a server side
    fn memory_client(api_url: &str) -> (ChatClient, Arc<Mutex<Vec<ServerSide>>>) {
        let servers = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&servers);
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_| {
            let (link, server) = memory::pair("sid-1");
            sink.lock().push(server);
            Ok(link)
        });

        let manager = ConnectionManager::new(Arc::new(connector), no_retry());
        let api = ChatApi::new(api_url, Duration::from_secs(5)).unwrap();
        (ChatClient::new(manager, api), servers)
    }

    /// Client whose socket never connects
    fn offline_client(api_url: &str) -> ChatClient {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|_| {
            Err(ConnectionError::ConnectFailed("connection refused".into()).into())
        });
        let manager = ConnectionManager::new(Arc::new(connector), no_retry());
        let api = ChatApi::new(api_url, Duration::from_secs(5)).unwrap();
        ChatClient::new(manager, api)
    }

    async fn connected(api_url: &str) -> (ChatClient, ServerSide) {
        let (client, servers) = memory_client(api_url);
        client.connect("abc").await.unwrap();
        let server = servers.lock().pop().unwrap();
        (client, server)
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Plays the backend for one streamed answer
    async fn stream_answer(server: &mut ServerSide, chat_id: &str) -> serde_json::Value {
        let (event, request) = server.next_emit().await.unwrap();
        assert_eq!(event, "chat_message");

        server.emit("chat_started", json!({})).await;
        server.emit("chat_info", json!({"chatId": chat_id})).await;
        server
            .emit("chat_chunk", json!({"content": "Recursion ", "fullContent": "Recursion "}))
            .await;
        server
            .emit("chat_chunk", json!({"content": "is when ", "fullContent": "Recursion is when "}))
            .await;
        server
            .emit(
                "chat_complete_chunk",
                json!({"content": "a function calls itself.", "fullContent": ANSWER}),
            )
            .await;
        server
            .emit(
                "chat_complete",
                json!({"chatId": chat_id, "aiResponse": {"role": "assistant", "content": ANSWER}}),
            )
            .await;
        request
    }

    #[tokio::test]
    async fn test_explain_recursion_end_to_end() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let mut conversation = Conversation::new("study-tools").with_sub_feature("explanations");
        let message = conversation.begin_exchange("Explain recursion", Some("You are a tutor."));

        let (handle, rx) = client.send_stream(message).unwrap();
        let request = stream_answer(&mut server, "c1").await;

        assert_eq!(request["content"], "Explain recursion");
        assert_eq!(request["feature"], "study-tools");
        assert_eq!(request["aiProvider"], "deepseek");
        assert_eq!(request["systemContext"], "You are a tutor.");
        assert!(request.get("chatId").is_none());

        let events = collect(rx).await;
        for event in &events {
            conversation.apply(event);
        }

        assert_eq!(events[0], StreamEvent::Started);
        assert_eq!(
            events[1],
            StreamEvent::Info {
                conversation_id: "c1".into()
            }
        );
        assert_eq!(
            events.last().unwrap(),
            &StreamEvent::Complete {
                final_message: AiResponse::assistant(ANSWER),
                conversation_id: Some("c1".into()),
            }
        );

        // Chunks grow monotonically and end as a prefix of the answer.
        let cumulative: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk {
                    cumulative_text, ..
                } => Some(cumulative_text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(cumulative.len(), 3);
        assert!(cumulative.windows(2).all(|w| w[1].len() >= w[0].len()));
        assert!(ANSWER.starts_with(cumulative[2]));

        match handle.outcome().await {
            Some(ExchangeOutcome::Completed(done)) => {
                assert_eq!(done.route, ExchangeRoute::Streaming);
                assert_eq!(done.conversation_id.as_deref(), Some("c1"));
            }
            other => panic!("Expected completion, got {:?}", other),
        }

        assert_eq!(conversation.conversation_id(), Some("c1"));
        assert_eq!(conversation.entries()[1].content, ANSWER);
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn test_at_most_one_terminal_event() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let (handle, rx) = client
            .send_stream(OutboundMessage::new("hi there", "study-tools"))
            .unwrap();

        server.next_emit().await.unwrap();
        server
            .emit("chat_complete", json!({"chatId": "c1", "aiResponse": {"content": "one"}}))
            .await;
        server.emit("chat_error", json!({"error": "late failure"})).await;
        server
            .emit("chat_complete", json!({"chatId": "c1", "aiResponse": {"content": "two"}}))
            .await;

        let events = collect(rx).await;
        let terminal: Vec<&StreamEvent> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(
            terminal[0],
            StreamEvent::Complete { final_message, .. } if final_message.content == "one"
        ));
        assert!(matches!(
            handle.outcome().await,
            Some(ExchangeOutcome::Completed(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_error_is_terminal() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let (handle, rx) = client
            .send_stream(OutboundMessage::new("hi there", "study-tools"))
            .unwrap();

        server.next_emit().await.unwrap();
        server.emit("chat_started", json!({})).await;
        server.emit("chat_error", json!({"error": "Model overloaded"})).await;

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Started,
                StreamEvent::Error {
                    reason: "Model overloaded".into()
                },
            ]
        );
        assert_eq!(
            handle.outcome().await,
            Some(ExchangeOutcome::Failed("Model overloaded".into()))
        );
    }

    #[tokio::test]
    async fn test_chunk_regression_fails_exchange() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);

        let handle = client
            .send(
                OutboundMessage::new("hi there", "study-tools"),
                ExchangeCallbacks::new().on_error(move |e| sink.lock().push(e)),
            )
            .unwrap();

        server.next_emit().await.unwrap();
        server.emit("chat_chunk", json!({"fullContent": "Recursion is"})).await;
        server.emit("chat_chunk", json!({"fullContent": "Recur"})).await;

        assert!(matches!(handle.outcome().await, Some(ExchangeOutcome::Failed(_))));
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_fallback_matches_streaming() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "chat": {"_id": "c2", "messages": []},
                    "aiResponse": {"role": "assistant", "content": ANSWER}
                }
            })))
            .expect(1)
            .mount(&backend)
            .await;

        // Streaming route.
        let (streaming, mut server) = connected(&backend.uri()).await;
        let (handle, _rx) = streaming
            .send_stream(OutboundMessage::new("Explain recursion", "study-tools"))
            .unwrap();
        stream_answer(&mut server, "c1").await;
        let Some(ExchangeOutcome::Completed(streamed)) = handle.outcome().await else {
            panic!("streaming exchange did not complete");
        };

        // Socket unavailable: the same request goes over HTTP.
        let offline = offline_client(&backend.uri());
        offline.connect("abc").await.unwrap();
        assert!(!offline.is_connected());

        let (handle, rx) = offline
            .send_stream(OutboundMessage::new("Explain recursion", "study-tools"))
            .unwrap();
        let events = collect(rx).await;
        assert_eq!(events.len(), 1, "fallback emits no chunks");

        let Some(ExchangeOutcome::Completed(fallback)) = handle.outcome().await else {
            panic!("fallback exchange did not complete");
        };
        assert_eq!(fallback.route, ExchangeRoute::Fallback);
        assert_eq!(fallback.conversation_id.as_deref(), Some("c2"));
        assert_eq!(fallback.final_message.content, streamed.final_message.content);
    }

    #[tokio::test]
    async fn test_fallback_failure_reports_backend_message() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/message"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"message": "AI provider unavailable"})),
            )
            .mount(&backend)
            .await;

        let client = offline_client(&backend.uri());
        client.connect("abc").await.unwrap();
        let (handle, rx) = client
            .send_stream(OutboundMessage::new("hi there", "study-tools"))
            .unwrap();

        assert_eq!(
            collect(rx).await,
            vec![StreamEvent::Error {
                reason: "AI provider unavailable".into()
            }]
        );
        assert!(handle.outcome().await.is_some());
    }

    #[tokio::test]
    async fn test_send_without_login_requires_authentication() {
        let client = offline_client("http://127.0.0.1:9/api");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);

        let handle = client
            .send(
                OutboundMessage::new("hi there", "study-tools"),
                ExchangeCallbacks::new().on_error(move |e| sink.lock().push(e)),
            )
            .unwrap();

        assert_eq!(
            handle.outcome().await,
            Some(ExchangeOutcome::Failed("Authentication error: Authentication required".into()))
        );
        assert!(matches!(errors.lock()[0], Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_listeners_do_not_leak_across_exchanges() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let first_chunks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&first_chunks);

        let first = client
            .send(
                OutboundMessage::new("Explain recursion", "study-tools"),
                ExchangeCallbacks::new().on_chunk(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        stream_answer(&mut server, "c1").await;
        first.outcome().await.unwrap();

        assert_eq!(first_chunks.load(Ordering::SeqCst), 3);
        assert_eq!(client.connection().listener_count(), 0);

        let (second, rx) = client
            .send_stream(OutboundMessage::new("Explain recursion", "study-tools").with_conversation("c1"))
            .unwrap();
        let request = stream_answer(&mut server, "c1").await;
        assert_eq!(request["chatId"], "c1");

        let events = collect(rx).await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        second.outcome().await.unwrap();

        assert_eq!(first_chunks.load(Ordering::SeqCst), 3);
        assert_eq!(client.connection().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_silences_exchange() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let (handle, mut rx) = client
            .send_stream(OutboundMessage::new("hi there", "study-tools"))
            .unwrap();

        server.next_emit().await.unwrap();
        server.emit("chat_started", json!({})).await;
        server
            .emit("chat_chunk", json!({"content": "Rec", "fullContent": "Rec"}))
            .await;
        assert_eq!(rx.recv().await, Some(StreamEvent::Started));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk { .. })));

        client.disconnect();
        server
            .emit("chat_complete", json!({"chatId": "c1", "aiResponse": {"content": "Rec"}}))
            .await;

        assert_eq!(handle.outcome().await, None);
        assert!(collect(rx).await.iter().all(|e| !e.is_terminal()));
        assert!(!client.is_busy());
        assert!(!client.api().has_token());
    }

    #[tokio::test]
    async fn test_dropped_link_fails_exchange() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);

        let handle = client
            .send(
                OutboundMessage::new("hi there", "study-tools"),
                ExchangeCallbacks::new().on_error(move |e| sink.lock().push(e)),
            )
            .unwrap();

        server.next_emit().await.unwrap();
        server.emit("chat_started", json!({})).await;
        server.close("transport error").await;

        assert!(matches!(handle.outcome().await, Some(ExchangeOutcome::Failed(_))));
        assert!(matches!(
            errors.lock()[0],
            Error::Connection(ConnectionError::LinkLost(_))
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_completion_without_chat_id_is_rejected() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);

        let handle = client
            .send(
                OutboundMessage::new("hi there", "study-tools"),
                ExchangeCallbacks::new().on_error(move |e| sink.lock().push(e)),
            )
            .unwrap();

        server.next_emit().await.unwrap();
        server.emit("chat_started", json!({})).await;
        server
            .emit("chat_complete", json!({"aiResponse": {"content": "orphan"}}))
            .await;

        assert!(matches!(handle.outcome().await, Some(ExchangeOutcome::Failed(_))));
        assert!(matches!(
            errors.lock()[0],
            Error::Protocol(ProtocolError::UnexpectedPacket(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_chat_id_confirms_conversation() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let mut conversation = Conversation::new("study-tools");
        let message = conversation.begin_exchange("Explain recursion", None);
        let (handle, rx) = client.send_stream(message).unwrap();

        server.next_emit().await.unwrap();
        server
            .emit("chat_complete", json!({"chatId": "c9", "aiResponse": {"content": ANSWER}}))
            .await;

        for event in collect(rx).await {
            conversation.apply(&event);
        }
        let Some(ExchangeOutcome::Completed(done)) = handle.outcome().await else {
            panic!("exchange did not complete");
        };
        assert_eq!(done.conversation_id.as_deref(), Some("c9"));
        assert_eq!(conversation.conversation_id(), Some("c9"));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_reconnects_and_streams() {
        let (servers_tx, mut servers_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ConnectionError::ConnectFailed("connection refused".into()).into());
            }
            let (link, server) = memory::pair("sid-2");
            let _ = servers_tx.send(server);
            Ok(link)
        });
        let manager = ConnectionManager::new(Arc::new(connector), no_retry());
        let api = ChatApi::new("http://127.0.0.1:9/api", Duration::from_secs(5)).unwrap();
        let client = ChatClient::new(manager, api);

        client.connect("abc").await.unwrap();
        assert!(!client.is_connected());

        let (handle, rx) = client
            .send_stream(OutboundMessage::new("Explain recursion", "study-tools"))
            .unwrap();
        let mut server = servers_rx.recv().await.unwrap();
        stream_answer(&mut server, "c1").await;

        let events = collect(rx).await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        let Some(ExchangeOutcome::Completed(done)) = handle.outcome().await else {
            panic!("exchange did not complete");
        };
        assert_eq!(done.route, ExchangeRoute::Streaming);
        assert_eq!(done.final_message.content, ANSWER);
        assert!(client.is_connected());
        assert_eq!(client.connection().reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_failed_emit_falls_back_to_http() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/message"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "chat": {"_id": "c3", "messages": []},
                    "aiResponse": {"role": "assistant", "content": ANSWER}
                }
            })))
            .expect(1)
            .mount(&backend)
            .await;

        let (client, server) = connected(&backend.uri()).await;
        // The writer side is gone while the link still looks open.
        let ServerSide { frames, events } = server;
        drop(frames);

        let (handle, rx) = client
            .send_stream(OutboundMessage::new("Explain recursion", "study-tools"))
            .unwrap();

        assert_eq!(collect(rx).await.len(), 1);
        let Some(ExchangeOutcome::Completed(done)) = handle.outcome().await else {
            panic!("fallback exchange did not complete");
        };
        assert_eq!(done.route, ExchangeRoute::Fallback);
        assert_eq!(done.conversation_id.as_deref(), Some("c3"));
        assert_eq!(client.connection().listener_count(), 0);
        drop(events);
    }

    #[tokio::test]
    async fn test_second_send_while_busy() {
        let (client, mut server) = connected("http://127.0.0.1:9/api").await;
        let first = client
            .send(OutboundMessage::new("hi there", "study-tools"), ExchangeCallbacks::new())
            .unwrap();
        server.next_emit().await.unwrap();

        let err = client
            .send(OutboundMessage::new("again", "study-tools"), ExchangeCallbacks::new())
            .unwrap_err();
        assert!(matches!(err, Error::ExchangeInFlight));

        client.disconnect();
        assert_eq!(first.outcome().await, None);
    }
}
