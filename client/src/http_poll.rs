use crate::error::Error;
use crate::transport::{PollDone, PollResponse, PollTransport, TransportHandle, TransportRequest};
use events::message::CLIENT_ID_HEADER;
use log::*;
use reqwest::Client;
use tokio::runtime::Handle;

/// Long-poll transport backed by `reqwest`. Closing the handle drops the
/// in-flight request, so an abort never reaches `done`.
pub struct HttpPollTransport {
    client: Client,
    runtime: Handle,
}

impl HttpPollTransport {
    /// Must be called from within a Tokio runtime.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            runtime: Handle::current(),
        }
    }
}

impl PollTransport for HttpPollTransport {
    fn fetch(&self, request: TransportRequest, done: PollDone) -> Box<dyn TransportHandle> {
        let client = self.client.clone();
        let handle = self.runtime.spawn(async move {
            let mut builder = client.get(request.url.clone());
            if let Some(client_id) = &request.client_id {
                builder = builder.header(CLIENT_ID_HEADER, client_id);
            }

            let outcome = match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    response
                        .text()
                        .await
                        .map(|body| PollResponse { status, body })
                        .map_err(|e| Error::Body(e.to_string()))
                }
                Err(e) => Err(Error::Network(e.to_string())),
            };
            trace!("Long-poll to {} finished: {outcome:?}", request.url);
            done(outcome);
        });
        Box::new(handle)
    }
}
