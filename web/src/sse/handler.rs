use crate::extractors::connection_headers::{ClientIdHeader, LastEventIdHeader};
use crate::params::message::IndexParams;
use async_stream::stream;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use log::*;
use service::AppState;
use sse::message::StreamEvent;
use sse::ConnectRequest;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// nginx's "Client Closed Request".
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// GET the message feed, as an event stream or as a single long-poll
#[utoipa::path(
    get,
    path = "/api/messages",
    params(
        IndexParams,
        ("Last-Event-ID" = Option<String>, Header, description = "Last event id seen by a reconnecting reader"),
        ("X-Client-Id" = Option<String>, Header, description = "Identity assigned by an earlier welcome")
    ),
    responses(
        (status = 200, description = "An event stream of chat and keep-alive envelopes, or one JSON envelope for a long-poll"),
        (status = 499, description = "The long-poll ended without a reply")
    )
)]
pub(crate) async fn messages_handler(
    State(app_state): State<AppState>,
    ClientIdHeader(client_id): ClientIdHeader,
    LastEventIdHeader(last_event_id): LastEventIdHeader,
    Query(params): Query<IndexParams>,
) -> Response {
    let longpoll = params.is_longpoll();
    let request = ConnectRequest::new(client_id, last_event_id.or(params.last_event_id));

    if longpoll {
        longpoll_reply(app_state, request).await
    } else {
        event_stream(app_state, request).into_response()
    }
}

fn event_stream(
    app_state: AppState,
    request: ConnectRequest,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(
        "Establishing event stream (client {:?}, last event {:?})",
        request.client_id, request.last_event_id
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    let subscription = app_state.manager.subscribe(Arc::new(tx), request);

    // Dropping the stream (client went away) drops the subscription with it.
    let stream = stream! {
        let _subscription = subscription;
        while let Some(message) = rx.recv().await {
            let mut event = Event::default().data(message.data);
            if let Some(id) = message.id {
                event = event.id(id);
            }
            yield Ok::<Event, Infallible>(event);
        }
        debug!("Event stream closed by the engine");
    };

    Sse::new(stream)
}

async fn longpoll_reply(app_state: AppState, request: ConnectRequest) -> Response {
    trace!("Long-poll from {:?}", request.client_id);

    let (tx, rx) = oneshot::channel();
    let subscription = app_state.manager.longpoll(
        request,
        Box::new(move |envelope| {
            let _ = tx.send(envelope);
        }),
    );

    match rx.await {
        Ok(envelope) => {
            drop(subscription);
            ([(header::CACHE_CONTROL, "no-store")], Json(envelope)).into_response()
        }
        Err(_) => {
            debug!("Long-poll ended without a reply");
            client_closed()
        }
    }
}

fn client_closed() -> Response {
    StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}
