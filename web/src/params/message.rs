use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub(crate) struct IndexParams {
    /// The last event id the reader has seen. The `Last-Event-ID` header wins when both are sent.
    pub(crate) last_event_id: Option<String>,
    /// Any value switches the request from an event stream to a single long-poll.
    pub(crate) sse_long_poll: Option<String>,
}

impl IndexParams {
    pub(crate) fn is_longpoll(&self) -> bool {
        self.sse_long_poll.is_some()
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct CreateParams {
    /// The text of the message.
    pub(crate) body: String,
}
