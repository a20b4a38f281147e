//! Connection manager for the persistent chat socket
//!
//! Owns the single authenticated link of a session, its reconnection policy
//! and the listener registry events are dispatched through. One manager is
//! created per login and shared by cloning; `disconnect` ends the session.

use super::registry::{EventEnvelope, ListenerRegistry, Subscription};
use super::traits::{Connector, Link, LinkTasks, OutboundFrame, SocketEvent};
use super::transport::WsConnector;
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{ConnectionError, Error, Result};
use crate::types::ConnectionState;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Grace period for the close frame to reach the server on disconnect
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Result of one reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectOutcome {
    Connected,
    Retry,
    GaveUp,
}

/// Handle returned by `connect`.
///
/// A handle is a view of the manager's state; it does not own the link.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sid: Option<String>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Socket.IO session id, when the connect call established the link
    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the manager is connected or has given up.
    ///
    /// Only meaningful while a reconnection is scheduled; with background
    /// reconnection disabled a failed connect stays `Disconnected`.
    pub async fn wait_connected(&mut self) -> bool {
        match self
            .state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed))
            .await
        {
            Ok(state) => *state == ConnectionState::Connected,
            Err(_) => false,
        }
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ActiveLink {
    sid: String,
    generation: u64,
    writer: mpsc::Sender<OutboundFrame>,
    tasks: LinkTasks,
    dispatcher: AbortOnDrop,
}

impl ActiveLink {
    /// Ask the server to close the namespace, then release the link tasks
    fn shutdown(self) {
        let ActiveLink {
            writer,
            tasks,
            dispatcher,
            ..
        } = self;
        drop(dispatcher);
        let _ = writer.try_send(OutboundFrame::Close);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    tokio::time::sleep(CLOSE_GRACE).await;
                    drop(tasks);
                });
            }
            Err(_) => drop(tasks),
        }
    }
}

#[derive(Default)]
struct Session {
    token: Option<String>,
    /// Reconnection attempts since the last successful connect
    attempts: u32,
    /// Bumped whenever the session is torn down or its token changes
    epoch: u64,
    /// Bumped for every installed link
    generation: u64,
    link: Option<ActiveLink>,
    reconnect_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

struct Shared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    registry: Arc<ListenerRegistry>,
    /// Serialises connection attempts
    attempt_lock: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
}

/// Manages the authenticated socket connection of one session
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                policy,
                state_tx,
                registry: ListenerRegistry::new(),
                attempt_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Build a manager that connects over WebSocket per the config
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let connector = WsConnector::from_config(config)?;
        Ok(Self::new(Arc::new(connector), config.reconnect.clone()))
    }

    /// Connect with a bearer token.
    ///
    /// Returns the existing connection when already connected with the same
    /// token. Transient failures do not error: the manager moves to
    /// `Disconnected`, schedules background reconnection and the returned
    /// handle reports not-connected.
    pub async fn connect(&self, token: &str) -> Result<ConnectionHandle> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Authentication("no token supplied".to_string()));
        }

        let epoch = {
            let mut session = self.shared.session.lock();
            if let Some(link) = &session.link {
                if session.token.as_deref() == Some(token) {
                    debug!("Already connected ({}), reusing link", link.sid);
                    return Ok(self.handle(Some(link.sid.clone())));
                }
            }

            // Free the attempt lock if a background reconnection holds it.
            if let Some(task) = session.reconnect_task.take() {
                task.abort();
            }
            if session.token.as_deref() != Some(token) {
                self.shared.reset_session(&mut session);
            }
            // An explicit connect starts a fresh retry budget.
            session.attempts = 0;
            session.token = Some(token.to_string());
            session.epoch
        };

        let _guard = self.shared.attempt_lock.lock().await;

        {
            let session = self.shared.session.lock();
            if session.epoch != epoch {
                return Err(ConnectionError::ConnectFailed(
                    "session was reset while connecting".to_string(),
                )
                .into());
            }
            if let Some(link) = &session.link {
                return Ok(self.handle(Some(link.sid.clone())));
            }
            self.shared.set_state(ConnectionState::Connecting);
        }

        info!("Connecting to chat server");

        match self.shared.connector.connect(token).await {
            Ok(link) => {
                let sid = link.sid().to_string();
                if self.shared.install(link, epoch) {
                    Ok(self.handle(Some(sid)))
                } else {
                    Err(ConnectionError::ConnectFailed(
                        "session was reset while connecting".to_string(),
                    )
                    .into())
                }
            }
            Err(Error::Authentication(message)) => {
                warn!("Server rejected credential: {}", message);
                let mut session = self.shared.session.lock();
                if session.epoch == epoch {
                    session.token = None;
                    self.shared.set_state(ConnectionState::Disconnected);
                }
                Err(Error::Authentication(message))
            }
            Err(e) => {
                error!("Connection error: {}", e);
                let mut session = self.shared.session.lock();
                if session.epoch == epoch {
                    self.shared.set_state(ConnectionState::Disconnected);
                    if self.shared.policy.auto_reconnect {
                        Shared::schedule_reconnect(&self.shared, &mut session);
                    }
                }
                Ok(self.handle(None))
            }
        }
    }

    /// Tear down the connection and cancel pending reconnection.
    ///
    /// In-flight exchanges are abandoned without a terminal callback.
    /// Calling this when already disconnected is a no-op.
    pub fn disconnect(&self) {
        let mut session = self.shared.session.lock();
        let was_active = session.link.is_some()
            || session.token.is_some()
            || session.reconnect_task.is_some();

        self.shared.reset_session(&mut session);
        session.token = None;
        self.shared.set_state(ConnectionState::Disconnected);

        if was_active {
            info!("Disconnected from server");
        }
    }

    /// Reconnect with linear backoff.
    ///
    /// Attempt `n` waits `n * base_delay` first. Returns `false` without
    /// connecting once the attempt ceiling is reached, or when no token is
    /// known; returns `true` at once if another caller already reconnected.
    pub async fn attempt_reconnect(&self) -> bool {
        Shared::try_reconnect(&self.shared).await == ReconnectOutcome::Connected
    }

    /// Last observed connection state; not a live probe
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state transitions, e.g. for a connection indicator
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.session.lock().attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    /// Token of the current session, if any
    pub fn token(&self) -> Option<String> {
        self.shared.session.lock().token.clone()
    }

    /// Queue an event for the server without waiting
    pub(crate) fn emit(&self, event: &str, data: Value) -> Result<()> {
        let writer = {
            let session = self.shared.session.lock();
            session.link.as_ref().map(|link| link.writer.clone())
        }
        .ok_or(ConnectionError::NotConnected)?;

        trace!("Emitting {}", event);
        writer
            .try_send(OutboundFrame::Emit {
                event: event.to_string(),
                data,
            })
            .map_err(|e| ConnectionError::SendFailed(e.to_string()).into())
    }

    /// Listen for every occurrence of an event on the current link
    pub(crate) fn on(
        &self,
        event: &str,
        sink: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Subscription {
        self.shared.registry.on(event, sink)
    }

    /// Listen for the next occurrence of an event on the current link
    pub(crate) fn once(
        &self,
        event: &str,
        sink: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Subscription {
        self.shared.registry.once(event, sink)
    }

    /// Token cancelled when this session is torn down
    pub(crate) fn session_cancellation(&self) -> CancellationToken {
        self.shared.session.lock().cancel.clone()
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.shared.registry.len()
    }

    fn handle(&self, sid: Option<String>) -> ConnectionHandle {
        ConnectionHandle {
            sid,
            state: self.shared.state_tx.subscribe(),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state: {} -> {}", previous, state);
        }
    }

    /// End the current link, listeners, exchanges and reconnection
    fn reset_session(&self, session: &mut Session) {
        session.cancel.cancel();
        session.cancel = CancellationToken::new();
        session.epoch += 1;
        session.attempts = 0;
        if let Some(task) = session.reconnect_task.take() {
            task.abort();
        }
        if let Some(link) = session.link.take() {
            link.shutdown();
        }
        self.registry.clear();
    }

    /// Adopt a freshly connected link unless the session moved on meanwhile
    fn install(self: &Arc<Self>, link: Link, epoch: u64) -> bool {
        let (sid, writer, inbound, tasks) = link.into_parts();

        let mut session = self.session.lock();
        if session.epoch != epoch {
            debug!("Discarding link {} from a stale session", sid);
            return false;
        }

        session.generation += 1;
        let generation = session.generation;
        let dispatcher = tokio::spawn(Self::dispatch_loop(
            Arc::downgrade(self),
            generation,
            inbound,
        ));

        info!("Connected to server ({})", sid);
        session.link = Some(ActiveLink {
            sid,
            generation,
            writer,
            tasks,
            dispatcher: AbortOnDrop(dispatcher),
        });
        session.attempts = 0;
        self.set_state(ConnectionState::Connected);
        true
    }

    /// Forward inbound events of one link to the registry
    async fn dispatch_loop(
        shared: Weak<Shared>,
        generation: u64,
        mut inbound: mpsc::Receiver<SocketEvent>,
    ) {
        let reason = loop {
            match inbound.recv().await {
                Some(SocketEvent::Event { name, data }) => {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    if shared.session.lock().generation != generation {
                        return;
                    }
                    if shared.registry.dispatch(&name, &data) == 0 {
                        trace!("No listener for {}", name);
                    }
                }
                Some(SocketEvent::Closed { reason }) => break reason,
                None => break "link closed".to_string(),
            }
        };

        if let Some(shared) = shared.upgrade() {
            shared.link_lost(generation, &reason);
        }
    }

    fn link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut session = self.session.lock();
        match &session.link {
            Some(link) if link.generation == generation => {}
            _ => return,
        }

        warn!("Disconnected from server: {}", reason);
        session.link = None;
        // Listeners of the dead link observe a closed channel.
        self.registry.clear();
        self.set_state(ConnectionState::Disconnected);

        if self.policy.auto_reconnect && session.token.is_some() {
            Self::schedule_reconnect(self, &mut session);
        }
    }

    fn schedule_reconnect(shared: &Arc<Self>, session: &mut Session) {
        if let Some(task) = &session.reconnect_task {
            if !task.is_finished() {
                return;
            }
        }

        let shared = Arc::clone(shared);
        session.reconnect_task = Some(tokio::spawn(async move {
            loop {
                match Self::try_reconnect(&shared).await {
                    ReconnectOutcome::Retry => continue,
                    ReconnectOutcome::Connected | ReconnectOutcome::GaveUp => break,
                }
            }
        }));
    }

    async fn try_reconnect(shared: &Arc<Self>) -> ReconnectOutcome {
        let _guard = shared.attempt_lock.lock().await;
        let max = shared.policy.max_attempts;

        let (token, attempt, epoch) = {
            let mut session = shared.session.lock();
            if session.link.is_some() {
                return ReconnectOutcome::Connected;
            }
            let Some(token) = session.token.clone() else {
                warn!("No token available, not reconnecting");
                return ReconnectOutcome::GaveUp;
            };
            if session.attempts >= max {
                error!("{}", ConnectionError::ReconnectExhausted(max));
                shared.set_state(ConnectionState::Failed);
                return ReconnectOutcome::GaveUp;
            }
            session.attempts += 1;
            shared.set_state(ConnectionState::Reconnecting);
            (token, session.attempts, session.epoch)
        };

        info!("Attempting to reconnect... ({}/{})", attempt, max);
        tokio::time::sleep(shared.policy.delay_for(attempt)).await;

        if shared.session.lock().epoch != epoch {
            return ReconnectOutcome::GaveUp;
        }

        let result =
            tokio::time::timeout(shared.policy.settle_window(), shared.connector.connect(&token))
                .await;

        let failure = match result {
            Ok(Ok(link)) => {
                return if shared.install(link, epoch) {
                    ReconnectOutcome::Connected
                } else {
                    ReconnectOutcome::GaveUp
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => ConnectionError::HandshakeTimeout.to_string(),
        };

        warn!("Reconnection attempt {} failed: {}", attempt, failure);

        let session = shared.session.lock();
        if session.epoch != epoch {
            return ReconnectOutcome::GaveUp;
        }
        if session.attempts >= max {
            error!("{}", ConnectionError::ReconnectExhausted(max));
            shared.set_state(ConnectionState::Failed);
            ReconnectOutcome::GaveUp
        } else {
            shared.set_state(ConnectionState::Disconnected);
            ReconnectOutcome::Retry
        }
    }
}
