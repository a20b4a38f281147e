//! Core type definitions for LearnChat
//!
//! Wire-level request/record types shared by the socket and HTTP paths, and
//! the event types an exchange reports back to its caller.

mod chat_types;
mod event_types;

pub use chat_types::*;
pub use event_types::*;
