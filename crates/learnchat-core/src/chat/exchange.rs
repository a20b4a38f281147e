//! Message exchange over the socket with HTTP fallback
//!
//! An exchange sends one `chat_message` and turns the server's event stream
//! into callbacks:
//!
//! ```text
//! [Idle] --send--> [Connecting?] --connected--> [Streaming] --terminal--> [Idle]
//!                        |--retries exhausted--> [Fallback] --response/error--> [Idle]
//! ```
//!
//! Exactly one of `on_complete` / `on_error` fires per exchange, unless the
//! session is torn down first, in which case the exchange ends silently.

use super::fallback::ChatApi;
use super::protocol::{
    self, ChatEvent, ChunkAccumulator, CHAT_CHUNK, CHAT_COMPLETE, CHAT_COMPLETE_CHUNK,
    CHAT_ERROR, CHAT_INFO, CHAT_MESSAGE, CHAT_STARTED,
};
use crate::error::{ConnectionError, Error, ProtocolError, Result};
use crate::socket::registry::{EventEnvelope, Subscription};
use crate::socket::ConnectionManager;
use crate::types::{
    ChatCompletion, ChatInfo, ChunkUpdate, ExchangeRoute, OutboundMessage, StreamEvent,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type StartedFn = Box<dyn FnOnce() + Send>;
type InfoFn = Box<dyn FnOnce(ChatInfo) + Send>;
type ChunkFn = Box<dyn FnMut(ChunkUpdate) + Send>;
type CompleteFn = Box<dyn FnOnce(ChatCompletion) + Send>;
type ErrorFn = Box<dyn FnOnce(Error) + Send>;

/// Callbacks for one exchange; all optional
#[derive(Default)]
pub struct ExchangeCallbacks {
    on_started: Option<StartedFn>,
    on_info: Option<InfoFn>,
    on_chunk: Option<ChunkFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
}

impl ExchangeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_started = Some(Box::new(f));
        self
    }

    pub fn on_info(mut self, f: impl FnOnce(ChatInfo) + Send + 'static) -> Self {
        self.on_info = Some(Box::new(f));
        self
    }

    pub fn on_chunk(mut self, f: impl FnMut(ChunkUpdate) + Send + 'static) -> Self {
        self.on_chunk = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(ChatCompletion) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Deliver every callback as a `StreamEvent` on a channel instead
    pub fn forward_to(sender: mpsc::UnboundedSender<StreamEvent>) -> Self {
        let started = sender.clone();
        let info = sender.clone();
        let chunk = sender.clone();
        let complete = sender.clone();

        Self::new()
            .on_started(move || {
                let _ = started.send(StreamEvent::Started);
            })
            .on_info(move |i| {
                let _ = info.send(i.into());
            })
            .on_chunk(move |c| {
                let _ = chunk.send(c.into());
            })
            .on_complete(move |done| {
                let _ = complete.send(done.into());
            })
            .on_error(move |e| {
                let _ = sender.send(StreamEvent::Error {
                    reason: e.to_string(),
                });
            })
    }
}

impl std::fmt::Debug for ExchangeCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCallbacks")
            .field("on_started", &self.on_started.is_some())
            .field("on_info", &self.on_info.is_some())
            .field("on_chunk", &self.on_chunk.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// How an exchange ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed(ChatCompletion),
    Failed(String),
}

/// Handle to a running exchange
#[derive(Debug)]
pub struct ExchangeHandle {
    id: Uuid,
    task: JoinHandle<Option<ExchangeOutcome>>,
}

impl ExchangeHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the exchange to end.
    ///
    /// `None` when it was abandoned by `disconnect` or aborted.
    pub async fn outcome(self) -> Option<ExchangeOutcome> {
        self.task.await.ok().flatten()
    }

    /// Stop the exchange without delivering a terminal callback
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Marks the owning client busy until dropped
#[derive(Debug)]
pub(crate) struct InFlight(Arc<AtomicBool>);

impl InFlight {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Invokes callbacks unless the session was torn down
struct Delivery {
    callbacks: ExchangeCallbacks,
    cancel: CancellationToken,
    in_flight: Option<InFlight>,
}

impl Delivery {
    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn started(&mut self) {
        if self.cancelled() {
            return;
        }
        if let Some(f) = self.callbacks.on_started.take() {
            f();
        }
    }

    fn info(&mut self, info: ChatInfo) {
        if self.cancelled() {
            return;
        }
        if let Some(f) = self.callbacks.on_info.take() {
            f(info);
        }
    }

    fn chunk(&mut self, update: ChunkUpdate) {
        if self.cancelled() {
            return;
        }
        if let Some(f) = self.callbacks.on_chunk.as_mut() {
            f(update);
        }
    }

    // Terminal deliveries consume the delivery so only one can happen. The
    // busy flag is released first so a callback may start the next exchange.

    fn complete(mut self, completion: ChatCompletion) -> Option<ExchangeOutcome> {
        if self.cancelled() {
            return None;
        }
        self.in_flight.take();
        if let Some(f) = self.callbacks.on_complete.take() {
            f(completion.clone());
        }
        Some(ExchangeOutcome::Completed(completion))
    }

    fn fail(mut self, error: Error) -> Option<ExchangeOutcome> {
        if self.cancelled() {
            return None;
        }
        self.in_flight.take();
        let reason = error.to_string();
        match self.callbacks.on_error.take() {
            Some(f) => f(error),
            None => warn!("Exchange failed without an error callback: {}", reason),
        }
        Some(ExchangeOutcome::Failed(reason))
    }
}

/// How the streaming phase ended
enum StreamEnd {
    Completed(ChatCompletion),
    Failed(Error),
    Fallback,
    Cancelled,
}

/// One send-and-receive cycle
pub(crate) struct Exchange {
    id: Uuid,
    connection: ConnectionManager,
    api: Arc<ChatApi>,
    message: OutboundMessage,
}

impl Exchange {
    pub fn new(connection: ConnectionManager, api: Arc<ChatApi>, message: OutboundMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
            api,
            message,
        }
    }

    /// Run the exchange on its own task
    pub fn spawn(self, callbacks: ExchangeCallbacks, in_flight: InFlight) -> ExchangeHandle {
        let delivery = Delivery {
            callbacks,
            cancel: self.connection.session_cancellation(),
            in_flight: Some(in_flight),
        };
        let id = self.id;
        let task = tokio::spawn(self.run(delivery));
        ExchangeHandle { id, task }
    }

    async fn run(self, mut delivery: Delivery) -> Option<ExchangeOutcome> {
        debug!("Exchange {} started", self.id);

        let end = self.stream(&mut delivery).await;
        match end {
            StreamEnd::Completed(completion) => delivery.complete(completion),
            StreamEnd::Failed(e) => delivery.fail(e),
            StreamEnd::Fallback => self.fallback(delivery).await,
            StreamEnd::Cancelled => {
                debug!("Exchange {} abandoned", self.id);
                None
            }
        }
    }

    /// Reconnect unless connected; `None` when the session ended meanwhile
    async fn ensure_connected(&self, cancel: &CancellationToken) -> Option<bool> {
        if self.connection.is_connected() {
            return Some(true);
        }
        info!("Socket not connected, attempting to reconnect...");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            ok = self.connection.attempt_reconnect() => Some(ok),
        }
    }

    /// Register this exchange's listeners and emit the request
    fn subscribe_and_emit(
        &self,
    ) -> Result<(Vec<Subscription>, mpsc::UnboundedReceiver<EventEnvelope>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = vec![
            self.connection.once(CHAT_STARTED, tx.clone()),
            self.connection.once(CHAT_INFO, tx.clone()),
            self.connection.on(CHAT_CHUNK, tx.clone()),
            self.connection.once(CHAT_COMPLETE_CHUNK, tx.clone()),
            self.connection.once(CHAT_COMPLETE, tx.clone()),
            self.connection.once(CHAT_ERROR, tx),
        ];

        let payload = serde_json::to_value(&self.message)?;
        self.connection.emit(CHAT_MESSAGE, payload)?;
        Ok((subscriptions, rx))
    }

    async fn stream(&self, delivery: &mut Delivery) -> StreamEnd {
        let cancel = delivery.cancel.clone();

        match self.ensure_connected(&cancel).await {
            None => return StreamEnd::Cancelled,
            Some(false) => {
                warn!("Socket unavailable, using HTTP fallback");
                return StreamEnd::Fallback;
            }
            Some(true) => {}
        }

        let (subscriptions, mut rx) = match self.subscribe_and_emit() {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to send message: {}", e);
                match self.ensure_connected(&cancel).await {
                    None => return StreamEnd::Cancelled,
                    Some(true) => match self.subscribe_and_emit() {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Resend failed ({}), using HTTP fallback", e);
                            return StreamEnd::Fallback;
                        }
                    },
                    Some(false) => {
                        warn!("Reconnection failed, using HTTP fallback");
                        return StreamEnd::Fallback;
                    }
                }
            }
        };

        let mut chunks = ChunkAccumulator::default();
        let mut conversation_id = self.message.conversation_id.clone();
        let mut info_seen = false;

        let end = loop {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                next = rx.recv() => next,
            };

            // Listeners are cleared when the link drops.
            let Some(envelope) = envelope else {
                if cancel.is_cancelled() {
                    break StreamEnd::Cancelled;
                }
                break StreamEnd::Failed(
                    ConnectionError::LinkLost("connection lost during exchange".to_string())
                        .into(),
                );
            };

            match protocol::decode_event(&envelope.name, &envelope.data) {
                Ok(Some(ChatEvent::Started)) => delivery.started(),
                Ok(Some(ChatEvent::Info(info))) => {
                    conversation_id = Some(info.conversation_id.clone());
                    info_seen = true;
                    delivery.info(info);
                }
                Ok(Some(ChatEvent::Chunk {
                    content,
                    full_content,
                })) => match chunks.push(content, full_content) {
                    Ok(update) => delivery.chunk(update),
                    Err(e) => break StreamEnd::Failed(e),
                },
                Ok(Some(ChatEvent::Complete {
                    conversation_id: completed_id,
                    final_message,
                })) => {
                    // A chat id on the completion stands in for a missed chat_info.
                    if !info_seen && completed_id.is_none() {
                        break StreamEnd::Failed(
                            ProtocolError::UnexpectedPacket(format!(
                                "{} before {} without a chat id",
                                CHAT_COMPLETE, CHAT_INFO
                            ))
                            .into(),
                        );
                    }
                    if !final_message.content.starts_with(chunks.text()) {
                        warn!(
                            "Final response of exchange {} does not extend the streamed text",
                            self.id
                        );
                    }
                    break StreamEnd::Completed(ChatCompletion {
                        conversation_id: completed_id.or(conversation_id),
                        final_message,
                        route: ExchangeRoute::Streaming,
                    });
                }
                Ok(Some(ChatEvent::Error(reason))) => break StreamEnd::Failed(Error::Remote(reason)),
                Ok(None) => {}
                Err(e) => {
                    warn!("Bad {} payload: {}", envelope.name, e);
                    break StreamEnd::Failed(e);
                }
            }
        };

        // Detach before any terminal callback runs.
        drop(subscriptions);
        end
    }

    async fn fallback(&self, delivery: Delivery) -> Option<ExchangeOutcome> {
        info!("Sending exchange {} over HTTP", self.id);

        let cancel = delivery.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = self.api.send_message(&self.message) => result,
        };

        match result {
            Ok(data) => delivery.complete(ChatCompletion {
                conversation_id: Some(data.chat.id),
                final_message: data.ai_response,
                route: ExchangeRoute::Fallback,
            }),
            Err(e) => delivery.fail(e),
        }
    }
}
