//! Connection seams for the socket layer
//!
//! - `Connector` - opens an authenticated link to the chat server
//! - `Link` - one established link: an outbound frame queue plus an inbound
//!   event queue, backed by whatever tasks the connector spawned

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames queued for the server
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Emit a named event with a JSON payload
    Emit { event: String, data: Value },
    /// Heartbeat reply
    Pong,
    /// Namespace disconnect, sent before closing
    Close,
}

/// Events received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A named application event
    Event { name: String, data: Value },
    /// The link is gone; no further events follow
    Closed { reason: String },
}

/// An established, authenticated link to the chat server
#[derive(Debug)]
pub struct Link {
    sid: String,
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: mpsc::Receiver<SocketEvent>,
    tasks: LinkTasks,
}

impl Link {
    pub fn new(
        sid: impl Into<String>,
        outbound: mpsc::Sender<OutboundFrame>,
        inbound: mpsc::Receiver<SocketEvent>,
    ) -> Self {
        Self {
            sid: sid.into(),
            outbound,
            inbound,
            tasks: LinkTasks(Vec::new()),
        }
    }

    /// Attach background tasks that live exactly as long as the link
    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = LinkTasks(tasks);
        self
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Split into the session id, writer half, reader half and task guard
    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        mpsc::Sender<OutboundFrame>,
        mpsc::Receiver<SocketEvent>,
        LinkTasks,
    ) {
        (self.sid, self.outbound, self.inbound, self.tasks)
    }
}

/// Background tasks of a link; aborted when dropped
#[derive(Debug)]
pub(crate) struct LinkTasks(Vec<JoinHandle<()>>);

impl Drop for LinkTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Opens links to the chat server.
///
/// Implementations perform the full handshake and only return once the
/// server has accepted the credential.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate with a bearer token
    async fn connect(&self, token: &str) -> Result<Link>;
}
