//! Cross-process pub/sub port between the publishing side and the
//! distribution engine.
//!
//! The only contract is `post(message)` / `on_message(handler)`: delivery is
//! at-least-once and may be reordered across restarts, so receivers must be
//! idempotent by timestamp. [`LocalChannel`] is the in-process implementation
//! used when a single process owns both sides.

use crate::message::{ChatMessage, TimeMs};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Newly published messages, oldest-first.
    Published { messages: Vec<ChatMessage> },
    /// A reader is handshaking and needs the publisher's view of history.
    HistoryRequest { id: String, last_time: Option<TimeMs> },
    /// The publisher's retained history, newest-first, and its lower bound.
    HistoryReply {
        id: String,
        lower_bound: TimeMs,
        messages: Vec<ChatMessage>,
    },
}

impl ChannelMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelMessage::Published { .. } => "published",
            ChannelMessage::HistoryRequest { .. } => "history_request",
            ChannelMessage::HistoryReply { .. } => "history_reply",
        }
    }
}

/// Receives every message posted on a channel.
/// Handlers ignore the variants they don't care about.
pub trait ChannelHandler: Send + Sync {
    fn on_message(&self, message: &ChannelMessage);
}

pub trait Channel: Send + Sync {
    fn post(&self, message: ChannelMessage);
    fn on_message(&self, handler: Arc<dyn ChannelHandler>);
}

/// Delivers posted messages synchronously to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Default)]
pub struct LocalChannel {
    handlers: RwLock<Vec<Arc<dyn ChannelHandler>>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Channel for LocalChannel {
    fn post(&self, message: ChannelMessage) {
        // Snapshot so a handler may register others or post re-entrantly.
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        trace!(
            "Posting {} to {} channel handler(s)",
            message.name(),
            handlers.len()
        );
        for handler in handlers.iter() {
            handler.on_message(&message);
        }
    }

    fn on_message(&self, handler: Arc<dyn ChannelHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }
}
