//! Chat exchanges, REST calls and transcript state
//!
//! - `client` - `ChatClient`, the entry point for a logged-in session
//! - `exchange` - one streamed send with HTTP fallback
//! - `fallback` - `ChatApi`, the chat REST endpoints
//! - `protocol` - chat event names and payloads
//! - `conversation` - transcript view model
//! - `display` - prompt scaffolding cleanup

pub mod client;
pub mod conversation;
pub mod display;
pub mod exchange;
pub mod fallback;
pub(crate) mod protocol;

pub use client::ChatClient;
pub use conversation::{Conversation, TranscriptEntry};
pub use display::{clean_message_for_display, extract_user_content};
pub use exchange::{ExchangeCallbacks, ExchangeHandle, ExchangeOutcome};
pub use fallback::ChatApi;
