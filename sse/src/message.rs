use crate::error::Error;
use events::message::Envelope;

/// One event on a push stream: a serialized envelope and its event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub data: String,
    pub id: Option<String>,
}

impl StreamEvent {
    pub fn new(data: impl Into<String>, id: Option<String>) -> Self {
        Self {
            data: data.into(),
            id,
        }
    }

    /// Serializes an envelope, using its timestamp as the event id.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, Error> {
        Ok(Self {
            data: envelope.to_json()?,
            id: Some(envelope.event_id()),
        })
    }
}
