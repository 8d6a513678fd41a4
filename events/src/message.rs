use serde::{Deserialize, Serialize};

/// Epoch milliseconds. Message timestamps double as event ids.
pub type TimeMs = i64;

/// Largest valid time value (epoch ms), matching the range of a JavaScript `Date`.
pub const MAX_TIME_VALUE: TimeMs = 8_640_000_000_000_000;
/// Smallest valid time value (epoch ms).
pub const MIN_TIME_VALUE: TimeMs = -MAX_TIME_VALUE;

/// Query parameter carrying the last seen event id when a header can't be set.
pub const LAST_EVENT_ID_QUERY: &str = "lastEventId";
/// Query parameter that turns a messages request into a long-poll.
pub const LONGPOLL_QUERY: &str = "sseLongPoll";
/// Standard event stream reconnection header.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
/// Header carrying a previously assigned client identity.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

pub fn is_time_value(value: i64) -> bool {
    (MIN_TIME_VALUE..=MAX_TIME_VALUE).contains(&value)
}

/// Parses a raw last-event-id into a time value.
///
/// Missing, non-integer or out-of-range ids are treated as absent.
pub fn time_from_event_id(raw: Option<&str>) -> Option<TimeMs> {
    let value = raw?.trim().parse::<i64>().ok()?;
    is_time_value(value).then_some(value)
}

/// Trait for getting the wire `kind` name of an envelope
pub trait EventType {
    fn event_type(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub timestamp: TimeMs,
    pub sender_id: String,
    pub body: String,
}

impl ChatMessage {
    pub fn new(timestamp: TimeMs, sender_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            timestamp,
            sender_id: sender_id.into(),
            body: body.into(),
        }
    }
}

/// The wire message exchanged between server and clients.
///
/// `messages` are always oldest-first on the wire. The constructors take
/// newest-first slices, which is how history is read internally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Envelope {
    #[serde(rename = "chat")]
    Chat {
        timestamp: TimeMs,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "welcome")]
    Welcome {
        timestamp: TimeMs,
        id: String,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "keep-alive")]
    KeepAlive { timestamp: TimeMs },
}

impl Envelope {
    pub fn chat(newest_first: Vec<ChatMessage>, timestamp: TimeMs, id: Option<String>) -> Self {
        Envelope::Chat {
            timestamp,
            id,
            messages: oldest_first(newest_first),
        }
    }

    pub fn welcome(newest_first: Vec<ChatMessage>, timestamp: TimeMs, id: String) -> Self {
        Envelope::Welcome {
            timestamp,
            id,
            messages: oldest_first(newest_first),
        }
    }

    pub fn keep_alive(timestamp: TimeMs) -> Self {
        Envelope::KeepAlive { timestamp }
    }

    /// Empty reply used when the publisher side could not be reached in time.
    /// Stamped with the minimum time value so the reader's next reconnect resyncs.
    pub fn unavailable(id: Option<String>) -> Self {
        Envelope::Chat {
            timestamp: MIN_TIME_VALUE,
            id,
            messages: Vec::new(),
        }
    }

    pub fn timestamp(&self) -> TimeMs {
        match self {
            Envelope::Chat { timestamp, .. }
            | Envelope::Welcome { timestamp, .. }
            | Envelope::KeepAlive { timestamp } => *timestamp,
        }
    }

    /// The event id sent alongside this envelope on a push stream.
    pub fn event_id(&self) -> String {
        self.timestamp().to_string()
    }

    /// Messages carried by this envelope, oldest-first.
    pub fn messages(&self) -> &[ChatMessage] {
        match self {
            Envelope::Chat { messages, .. } | Envelope::Welcome { messages, .. } => messages,
            Envelope::KeepAlive { .. } => &[],
        }
    }

    /// The client identity carried by this envelope, if any.
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Envelope::Chat { id, .. } => id.as_deref(),
            Envelope::Welcome { id, .. } => Some(id),
            Envelope::KeepAlive { .. } => None,
        }
    }

    pub fn newest_message_timestamp(&self) -> Option<TimeMs> {
        self.messages().last().map(|message| message.timestamp)
    }

    /// Appends messages that are newer than anything already carried, given
    /// newest-first, and moves the envelope timestamp forward to the newest one.
    /// Keep-alives are left untouched.
    pub fn extend_newer(&mut self, newest_first: Vec<ChatMessage>) {
        let floor = self.newest_message_timestamp();
        match self {
            Envelope::Chat {
                timestamp,
                messages,
                ..
            }
            | Envelope::Welcome {
                timestamp,
                messages,
                ..
            } => {
                for message in newest_first.into_iter().rev() {
                    if floor.is_some_and(|floor| message.timestamp <= floor) {
                        continue;
                    }
                    *timestamp = (*timestamp).max(message.timestamp);
                    messages.push(message);
                }
            }
            Envelope::KeepAlive { .. } => {}
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses and validates a wire envelope. Anything that is not a well
    /// formed envelope with valid time values yields `None`.
    pub fn from_json(raw: &str) -> Option<Envelope> {
        let envelope: Envelope = serde_json::from_str(raw).ok()?;
        envelope.is_valid().then_some(envelope)
    }

    fn is_valid(&self) -> bool {
        is_time_value(self.timestamp())
            && self
                .messages()
                .iter()
                .all(|message| is_time_value(message.timestamp))
    }
}

impl EventType for Envelope {
    fn event_type(&self) -> &'static str {
        match self {
            Envelope::Chat { .. } => "chat",
            Envelope::Welcome { .. } => "welcome",
            Envelope::KeepAlive { .. } => "keep-alive",
        }
    }
}

fn oldest_first(mut messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages.reverse();
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(timestamp: TimeMs, body: &str) -> ChatMessage {
        ChatMessage::new(timestamp, "sender-1", body)
    }

    #[test]
    fn chat_serializes_oldest_first_with_camel_case_fields() {
        let envelope = Envelope::chat(vec![message(20, "second"), message(10, "first")], 20, None);

        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "kind": "chat",
                "timestamp": 20,
                "messages": [
                    { "timestamp": 10, "senderId": "sender-1", "body": "first" },
                    { "timestamp": 20, "senderId": "sender-1", "body": "second" }
                ]
            })
        );
    }

    #[test]
    fn keep_alive_uses_hyphenated_kind() {
        let value: serde_json::Value =
            serde_json::from_str(&Envelope::keep_alive(5).to_json().unwrap()).unwrap();

        assert_eq!(value, json!({ "kind": "keep-alive", "timestamp": 5 }));
        assert_eq!(Envelope::keep_alive(5).event_type(), "keep-alive");
    }

    #[test]
    fn from_json_accepts_a_welcome() {
        let raw = r#"{"kind":"welcome","timestamp":7,"id":"abc","messages":[{"timestamp":7,"senderId":"x","body":"hi"}]}"#;

        let envelope = Envelope::from_json(raw).expect("welcome should parse");

        assert_eq!(envelope.client_id(), Some("abc"));
        assert_eq!(envelope.newest_message_timestamp(), Some(7));
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        assert_eq!(Envelope::from_json("not json"), None);
        assert_eq!(Envelope::from_json(r#"{"kind":"shout","timestamp":1}"#), None);
        assert_eq!(
            Envelope::from_json(r#"{"kind":"chat","timestamp":1.5,"messages":[]}"#),
            None,
            "fractional timestamps are not time values"
        );
        assert_eq!(
            Envelope::from_json(r#"{"kind":"keep-alive","timestamp":8640000000000001}"#),
            None,
            "out of range timestamps are rejected"
        );
        assert_eq!(
            Envelope::from_json(
                r#"{"kind":"chat","timestamp":1,"messages":[{"timestamp":1,"senderId":3,"body":"x"}]}"#
            ),
            None,
            "senderId must be a string"
        );
    }

    #[test]
    fn event_ids_outside_the_time_range_are_absent() {
        assert_eq!(time_from_event_id(Some("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(time_from_event_id(Some(" 42 ")), Some(42));
        assert_eq!(time_from_event_id(Some("abc")), None);
        assert_eq!(time_from_event_id(Some("1.5")), None);
        assert_eq!(time_from_event_id(Some("8640000000000001")), None);
        assert_eq!(time_from_event_id(None), None);
    }

    #[test]
    fn extend_newer_skips_messages_already_carried() {
        let mut envelope = Envelope::welcome(vec![message(20, "b"), message(10, "a")], 20, "id".into());

        envelope.extend_newer(vec![message(30, "c"), message(20, "b")]);

        let timestamps: Vec<TimeMs> = envelope.messages().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert_eq!(envelope.timestamp(), 30);
    }
}
