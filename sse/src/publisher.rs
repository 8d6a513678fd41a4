//! The publishing side of the channel.
//!
//! A `Publisher` stamps and records new messages, announces them on the
//! channel, and answers handshake history requests from its own, longer lived
//! history.

use crate::error::Error;
use crate::history::HistoryStore;
use events::channel::{Channel, ChannelHandler, ChannelMessage};
use events::clock::Clock;
use events::message::{ChatMessage, TimeMs, MIN_TIME_VALUE};
use log::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

struct Core {
    store: HistoryStore,
    last_timestamp: TimeMs,
}

struct Inner {
    clock: Arc<dyn Clock>,
    channel: Arc<dyn Channel>,
    core: Mutex<Core>,
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    /// Creates a publisher that retains `retention` worth of history and
    /// answers history requests posted on `channel`.
    pub fn new(clock: Arc<dyn Clock>, channel: Arc<dyn Channel>, retention: Duration) -> Self {
        let inner = Arc::new(Inner {
            clock,
            channel: Arc::clone(&channel),
            core: Mutex::new(Core {
                store: HistoryStore::new(retention),
                last_timestamp: MIN_TIME_VALUE,
            }),
        });
        channel.on_message(Arc::new(PublisherHandler(Arc::downgrade(&inner))));
        Self { inner }
    }

    /// Records a new message and announces it to every engine on the channel.
    ///
    /// Timestamps are strictly increasing, so they stay usable as event ids even
    /// when two messages arrive within the same millisecond.
    pub fn publish(&self, body: &str, sender_id: &str) -> Result<ChatMessage, Error> {
        if body.trim().is_empty() {
            return Err(Error::invalid_input("message body is empty"));
        }
        if sender_id.trim().is_empty() {
            return Err(Error::invalid_input("sender id is empty"));
        }

        let message = {
            let mut core = self.inner.core();
            let now = self.inner.clock.now_ms();
            let timestamp = now.max(core.last_timestamp + 1);
            core.last_timestamp = timestamp;

            let message = ChatMessage::new(timestamp, sender_id, body);
            core.store.append(now, message.clone());
            message
        };

        info!(
            "Published message {} from {}",
            message.timestamp, message.sender_id
        );
        self.inner.channel.post(ChannelMessage::Published {
            messages: vec![message.clone()],
        });
        Ok(message)
    }

    pub fn lower_bound(&self) -> TimeMs {
        self.inner.core().store.lower_bound()
    }

    pub fn len(&self) -> usize {
        self.inner.core().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reply_to(&self, id: &str) {
        let (lower_bound, messages) = {
            let mut core = self.core();
            core.store.purge_expired(self.clock.now_ms());
            (core.store.lower_bound(), core.store.slice_after(None))
        };

        debug!(
            "Answering history request {id} with {} message(s)",
            messages.len()
        );
        self.channel.post(ChannelMessage::HistoryReply {
            id: id.to_owned(),
            lower_bound,
            messages,
        });
    }
}

/// Bridges channel traffic to the publisher without keeping it alive.
struct PublisherHandler(Weak<Inner>);

impl ChannelHandler for PublisherHandler {
    fn on_message(&self, message: &ChannelMessage) {
        if let ChannelMessage::HistoryRequest { id, .. } = message {
            if let Some(inner) = self.0.upgrade() {
                inner.reply_to(id);
            }
        }
    }
}
