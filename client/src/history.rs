use events::message::{ChatMessage, Envelope, TimeMs, MIN_TIME_VALUE};

/// The reader's view of the conversation, newest message first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHistory {
    client_id: Option<String>,
    messages: Vec<ChatMessage>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn newest_timestamp(&self) -> Option<TimeMs> {
        self.messages.first().map(|message| message.timestamp)
    }

    /// Adopts the identity from a welcome and replaces the history with its
    /// messages. A welcome stamped with the minimum time value carries no
    /// usable history, so only the identity is taken from it.
    pub fn reset(&mut self, id: &str, timestamp: TimeMs, oldest_first: &[ChatMessage]) {
        self.client_id = Some(id.to_owned());
        if timestamp > MIN_TIME_VALUE {
            self.messages = oldest_first.iter().rev().cloned().collect();
        }
    }

    /// Puts newer messages at the head. Returns how many were added; messages
    /// not newer than the current head are duplicates and dropped.
    pub fn shunt(&mut self, oldest_first: &[ChatMessage]) -> usize {
        let mut head = self.newest_timestamp();
        let mut newer = Vec::new();
        for message in oldest_first {
            if head.is_some_and(|head| message.timestamp <= head) {
                continue;
            }
            head = Some(message.timestamp);
            newer.push(message.clone());
        }

        let added = newer.len();
        if added > 0 {
            newer.reverse();
            newer.append(&mut self.messages);
            self.messages = newer;
        }
        added
    }

    /// Applies an inbound envelope; returns whether the history changed.
    pub fn apply(&mut self, envelope: &Envelope) -> bool {
        match envelope {
            Envelope::Welcome {
                timestamp,
                id,
                messages,
            } => {
                self.reset(id, *timestamp, messages);
                true
            }
            Envelope::Chat {
                timestamp,
                messages,
                ..
            } if *timestamp > MIN_TIME_VALUE => self.shunt(messages) > 0,
            Envelope::Chat { .. } | Envelope::KeepAlive { .. } => false,
        }
    }
}
