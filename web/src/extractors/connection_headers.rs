use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use events::message::{CLIENT_ID_HEADER, LAST_EVENT_ID_HEADER};
use std::convert::Infallible;

/// The reader's prior identity from `X-Client-Id`, if it sent one.
pub(crate) struct ClientIdHeader(pub Option<String>);

/// `Last-Event-ID`, set by EventSource implementations when they reconnect.
pub(crate) struct LastEventIdHeader(pub Option<String>);

impl<S> FromRequestParts<S> for ClientIdHeader
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIdHeader(header_value(&parts.headers, CLIENT_ID_HEADER)))
    }
}

impl<S> FromRequestParts<S> for LastEventIdHeader
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(LastEventIdHeader(header_value(
            &parts.headers,
            LAST_EVENT_ID_HEADER,
        )))
    }
}

// Blank and non-ASCII values count as absent.
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
