use crate::manager::Engine;
use events::channel::{ChannelHandler, ChannelMessage};
use log::*;
use std::sync::Weak;

/// Handles channel traffic on behalf of the distribution engine.
///
/// This handler is responsible for:
/// 1. Feeding newly published messages into the engine's ring and fan-out
/// 2. Completing pending handshakes with the publisher's history replies
///
/// History requests are the publisher's business and are ignored here. The
/// engine is held weakly so the channel never keeps it alive.
pub(crate) struct EngineChannelHandler {
    engine: Weak<Engine>,
}

impl EngineChannelHandler {
    pub(crate) fn new(engine: Weak<Engine>) -> Self {
        Self { engine }
    }
}

impl ChannelHandler for EngineChannelHandler {
    fn on_message(&self, message: &ChannelMessage) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        match message {
            ChannelMessage::Published { messages } => {
                debug!("Handling {} published message(s)", messages.len());
                engine.receive_published(messages);
            }
            ChannelMessage::HistoryReply {
                id,
                lower_bound,
                messages,
            } => {
                debug!("Handling history reply for handshake {id}");
                engine.receive_history_reply(id, *lower_bound, messages.clone());
            }
            ChannelMessage::HistoryRequest { .. } => {}
        }
    }
}
