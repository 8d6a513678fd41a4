use crate::error::Error;
use crate::transport::{PushTransport, SignalSink, StreamSignal, TransportHandle, TransportRequest};
use eventsource_client::{self as es, Client};
use events::message::CLIENT_ID_HEADER;
use futures_util::stream::StreamExt;
use log::*;
use tokio::runtime::Handle;

/// Push transport backed by `eventsource-client`.
pub struct EventSourceTransport {
    runtime: Handle,
}

impl EventSourceTransport {
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self {
            runtime: Handle::current(),
        }
    }

    fn build(request: &TransportRequest) -> Result<impl Client, Error> {
        let mut builder = es::ClientBuilder::for_url(request.url.as_str())
            .map_err(|e| Error::Stream(e.to_string()))?;
        if let Some(client_id) = &request.client_id {
            builder = builder
                .header(CLIENT_ID_HEADER, client_id)
                .map_err(|e| Error::Stream(e.to_string()))?;
        }
        Ok(builder.build())
    }
}

impl Default for EventSourceTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PushTransport for EventSourceTransport {
    fn open(&self, request: TransportRequest, on_signal: SignalSink) -> Box<dyn TransportHandle> {
        let handle = self.runtime.spawn(async move {
            let client = match Self::build(&request) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Could not open {}: {e}", request.url);
                    on_signal(StreamSignal::Error { closed: true });
                    return;
                }
            };
            let mut stream = client.stream();

            loop {
                match stream.next().await {
                    Some(Ok(es::SSE::Event(event))) => on_signal(StreamSignal::Message {
                        data: event.data,
                        event_id: event.id,
                    }),
                    Some(Ok(es::SSE::Comment(_))) => {}
                    Some(Err(e)) => {
                        let closed = matches!(
                            e,
                            es::Error::UnexpectedResponse(..) | es::Error::InvalidParameter(..)
                        );
                        warn!("Event stream error ({}): {e:?}", request.url);
                        on_signal(StreamSignal::Error { closed });
                        if closed {
                            break;
                        }
                    }
                    None => {
                        debug!("Event stream ended for {}", request.url);
                        on_signal(StreamSignal::Error { closed: true });
                        break;
                    }
                }
            }
        });
        Box::new(handle)
    }
}
