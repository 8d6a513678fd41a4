//! Seams between the connection state machine and the network.
//!
//! Transports never call back synchronously from `open`/`fetch`, and never
//! call back at all once their handle has been closed.

use crate::error::Error;
use std::sync::Arc;
use url::Url;

/// What the connection knows when it opens a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: Url,
    pub client_id: Option<String>,
}

/// Keeps a transport alive; `close` tears it down.
pub trait TransportHandle: Send {
    fn close(&mut self);
}

impl TransportHandle for tokio::task::JoinHandle<()> {
    fn close(&mut self) {
        self.abort();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Message {
        data: String,
        event_id: Option<String>,
    },
    /// `closed` is set when the transport gave up and won't reconnect on its own.
    Error { closed: bool },
}

pub type SignalSink = Arc<dyn Fn(StreamSignal) + Send + Sync>;

pub trait PushTransport: Send + Sync {
    fn open(&self, request: TransportRequest, on_signal: SignalSink) -> Box<dyn TransportHandle>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResponse {
    pub status: u16,
    pub body: String,
}

impl PollResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type PollDone = Box<dyn FnOnce(Result<PollResponse, Error>) + Send>;

pub trait PollTransport: Send + Sync {
    /// Starts one request. `done` runs once with the outcome, unless the
    /// handle is closed first.
    fn fetch(&self, request: TransportRequest, done: PollDone) -> Box<dyn TransportHandle>;
}
