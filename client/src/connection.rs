//! The reader side of the relay.
//!
//! A `ClientConnection` starts with the event stream and falls back to
//! long-polling when the stream fails before delivering anything. A deadman
//! timer cycles the connection when nothing (not even a keep-alive) arrives
//! for too long, which catches transports that are open but stalled.
//!
//! Status codes follow the wire-visible convention:
//!
//! | code | status   | meaning |
//! |------|----------|---------|
//! | -1   | Failed   | long-polling failed too; no automatic retry |
//! | 0    | Idle     | no connection attempted yet |
//! | 1    | Waiting  | event stream opened, nothing received yet |
//! | 2    | Message  | at least one message arrived over the stream |
//! | 3    | Longpoll | the stream failed early, polling from now on |

use crate::error::Error;
use crate::history::MessageHistory;
use crate::href::messages_url;
use crate::transport::{
    PollResponse, PollTransport, PushTransport, SignalSink, StreamSignal, TransportHandle,
    TransportRequest,
};
use events::clock::{Clock, TimerHandle};
use events::idle_timer::IdleTimer;
use events::message::Envelope;
use log::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Failed,
    Idle,
    Waiting,
    Message,
    Longpoll,
}

impl ConnectStatus {
    pub fn code(self) -> i8 {
        match self {
            ConnectStatus::Failed => -1,
            ConnectStatus::Idle => 0,
            ConnectStatus::Waiting => 1,
            ConnectStatus::Message => 2,
            ConnectStatus::Longpoll => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub base_url: Url,
    /// Silence after which the connection is cycled.
    pub deadman: Duration,
    /// Pause between successful long-polls.
    pub poll_between: Duration,
    /// Pause before the next long-poll after one went wrong.
    pub poll_backoff: Duration,
    /// Skip the event stream and poll from the start.
    pub force_longpoll: bool,
}

impl ConnectionConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            deadman: Duration::from_millis(20_000),
            poll_between: Duration::from_millis(50),
            poll_backoff: Duration::from_millis(10_000),
            force_longpoll: false,
        }
    }
}

enum Link {
    Down,
    Stream {
        handle: Box<dyn TransportHandle>,
        waiting: bool,
    },
    Poll {
        timer: Option<TimerHandle>,
        in_flight: Option<Box<dyn TransportHandle>>,
    },
}

impl Link {
    fn is_active(&self) -> bool {
        match self {
            Link::Down => false,
            Link::Stream { .. } => true,
            Link::Poll { timer, in_flight } => timer.is_some() || in_flight.is_some(),
        }
    }
}

struct Core {
    status: ConnectStatus,
    use_longpoll: bool,
    last_event_id: Option<String>,
    history: MessageHistory,
    references: usize,
    // Bumped on every connect and disconnect; callbacks from older links are stale.
    generation: u64,
    poll_failures: u32,
    link: Link,
}

struct Inner {
    config: ConnectionConfig,
    clock: Arc<dyn Clock>,
    push: Arc<dyn PushTransport>,
    poll: Arc<dyn PollTransport>,
    deadman: IdleTimer,
    core: Mutex<Core>,
    status_tx: watch::Sender<ConnectStatus>,
    history_tx: watch::Sender<MessageHistory>,
}

/// Reference-counted connection to a relay's message feed.
///
/// The connection is up while at least one [`ConnectionGuard`] is alive.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

/// Keeps the connection up while held.
#[must_use = "the connection goes down when the guard is dropped"]
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.change_references(false);
    }
}

impl ClientConnection {
    pub fn new(
        config: ConnectionConfig,
        clock: Arc<dyn Clock>,
        push: Arc<dyn PushTransport>,
        poll: Arc<dyn PollTransport>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectStatus::Idle);
        let (history_tx, _) = watch::channel(MessageHistory::new());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_silence = weak.clone();
            let deadman = IdleTimer::new(Arc::clone(&clock), config.deadman, move || {
                if let Some(inner) = on_silence.upgrade() {
                    info!("No traffic for {:?}, cycling the connection", inner.config.deadman);
                    inner.cycle();
                }
            });

            Inner {
                core: Mutex::new(Core {
                    status: ConnectStatus::Idle,
                    use_longpoll: config.force_longpoll,
                    last_event_id: None,
                    history: MessageHistory::new(),
                    references: 0,
                    generation: 0,
                    poll_failures: 0,
                    link: Link::Down,
                }),
                config,
                clock,
                push,
                poll,
                deadman,
                status_tx,
                history_tx,
            }
        });
        Self { inner }
    }

    /// Takes a reference; the first one brings the connection up.
    pub fn acquire(&self) -> ConnectionGuard {
        self.inner.change_references(true);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Tears down and re-establishes the connection, e.g. after it failed.
    pub fn reconnect(&self) {
        self.inner.cycle();
    }

    pub fn status(&self) -> ConnectStatus {
        self.inner.core().status
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn history(&self) -> MessageHistory {
        self.inner.core().history.clone()
    }

    pub fn watch_history(&self) -> watch::Receiver<MessageHistory> {
        self.inner.history_tx.subscribe()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.inner.core().last_event_id.clone()
    }

    /// Whether a stream is open or a poll is scheduled or in flight.
    pub fn is_active(&self) -> bool {
        self.inner.core().link.is_active()
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Re-evaluated on every change, so redundant calls are harmless.
    fn change_references(self: &Arc<Self>, increment: bool) {
        let mut core = self.core();
        core.references = if increment {
            core.references + 1
        } else {
            core.references.saturating_sub(1)
        };

        if core.link.is_active() {
            if core.references < 1 {
                debug!("Last reference released, disconnecting");
                self.disconnect(&mut core);
            }
        } else if core.references > 0 {
            self.disconnect(&mut core);
            self.connect(&mut core);
        }
    }

    fn cycle(self: &Arc<Self>) {
        let mut core = self.core();
        self.disconnect(&mut core);
        self.connect(&mut core);
    }

    fn connect(self: &Arc<Self>, core: &mut Core) {
        if core.references < 1 {
            return;
        }
        if core.use_longpoll {
            self.connect_poll(core);
        } else {
            self.connect_stream(core);
        }
    }

    fn connect_stream(self: &Arc<Self>, core: &mut Core) {
        let url = match messages_url(&self.config.base_url, core.last_event_id.as_deref(), true) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot connect: {e}");
                self.set_status(core, ConnectStatus::Failed);
                return;
            }
        };

        core.generation += 1;
        let sink = self.signal_sink(core.generation);
        debug!("Opening event stream {url}");
        let handle = self.push.open(self.request(core, url), sink);
        core.link = Link::Stream {
            handle,
            waiting: true,
        };
        self.set_status(core, ConnectStatus::Waiting);
        self.deadman.start();
    }

    fn connect_poll(self: &Arc<Self>, core: &mut Core) {
        core.generation += 1;
        core.link = Link::Poll {
            timer: None,
            in_flight: None,
        };
        if core.status != ConnectStatus::Longpoll {
            self.set_status(core, ConnectStatus::Longpoll);
        }

        let delay = if core.poll_failures < 1 {
            self.config.poll_between
        } else {
            self.config.poll_backoff
        };
        self.schedule_poll(core, delay);
    }

    fn disconnect(&self, core: &mut Core) {
        core.generation += 1;
        match std::mem::replace(&mut core.link, Link::Down) {
            Link::Down => return,
            Link::Stream { mut handle, .. } => handle.close(),
            Link::Poll { timer, in_flight } => {
                if let Some(timer) = timer {
                    self.clock.cancel(timer);
                }
                if let Some(mut in_flight) = in_flight {
                    // An aborted poll counts against the next attempt.
                    core.poll_failures += 1;
                    in_flight.close();
                }
            }
        }
        self.deadman.stop();
    }

    fn request(&self, core: &Core, url: Url) -> TransportRequest {
        TransportRequest {
            url,
            client_id: core.history.client_id().map(str::to_owned),
        }
    }

    fn signal_sink(self: &Arc<Self>, generation: u64) -> SignalSink {
        let weak = Arc::downgrade(self);
        Arc::new(move |signal| {
            if let Some(inner) = weak.upgrade() {
                inner.on_stream_signal(generation, signal);
            }
        })
    }

    fn on_stream_signal(self: &Arc<Self>, generation: u64, signal: StreamSignal) {
        let mut core = self.core();
        if core.generation != generation {
            return;
        }

        match signal {
            StreamSignal::Message { data, event_id } => {
                self.deadman.start();
                if let Link::Stream { waiting, .. } = &mut core.link {
                    *waiting = false;
                }

                let Some(envelope) = Envelope::from_json(&data) else {
                    debug!("Ignoring unrecognized event data");
                    return;
                };
                self.set_status(&mut core, ConnectStatus::Message);
                self.update(&mut core, &envelope, event_id);
            }
            StreamSignal::Error { closed } => {
                let waiting = matches!(core.link, Link::Stream { waiting: true, .. });
                if !(closed && waiting) {
                    debug!("Event stream error (closed: {closed})");
                    return;
                }

                warn!("Event stream failed before its first message, falling back to long-polling");
                self.disconnect(&mut core);
                core.use_longpoll = true;
                self.set_status(&mut core, ConnectStatus::Longpoll);

                let weak = Arc::downgrade(self);
                self.clock.after(
                    Duration::ZERO,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.cycle();
                        }
                    }),
                );
            }
        }
    }

    fn schedule_poll(self: &Arc<Self>, core: &mut Core, delay: Duration) {
        let generation = core.generation;
        let weak = Arc::downgrade(self);
        let handle = self.clock.after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fetch_poll(generation);
                }
            }),
        );
        if let Link::Poll { timer, .. } = &mut core.link {
            *timer = Some(handle);
        }
    }

    fn fetch_poll(self: &Arc<Self>, generation: u64) {
        let mut core = self.core();
        if core.generation != generation || !matches!(core.link, Link::Poll { .. }) {
            return;
        }

        let url = match messages_url(&self.config.base_url, core.last_event_id.as_deref(), false)
        {
            Ok(url) => url,
            Err(e) => {
                self.poll_failed(&mut core, e);
                return;
            }
        };
        let request = self.request(&core, url);

        let weak = Arc::downgrade(self);
        self.deadman.start();
        let handle = self.poll.fetch(
            request,
            Box::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    inner.poll_finished(generation, result);
                }
            }),
        );
        core.link = Link::Poll {
            timer: None,
            in_flight: Some(handle),
        };
    }

    fn poll_finished(self: &Arc<Self>, generation: u64, result: Result<PollResponse, Error>) {
        let mut core = self.core();
        if core.generation != generation {
            return;
        }
        self.deadman.stop();
        if let Link::Poll { in_flight, .. } = &mut core.link {
            *in_flight = None;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.poll_failed(&mut core, e);
                return;
            }
        };

        let envelope = if response.is_ok() {
            Envelope::from_json(&response.body)
        } else {
            None
        };
        match envelope {
            Some(envelope) => {
                core.poll_failures = 0;
                let event_id = envelope.event_id();
                self.update(&mut core, &envelope, Some(event_id));
                self.schedule_poll(&mut core, self.config.poll_between);
            }
            None => {
                core.poll_failures += 1;
                warn!(
                    "Long-poll returned {} without a usable reply, backing off",
                    response.status
                );
                self.schedule_poll(&mut core, self.config.poll_backoff);
            }
        }
    }

    fn poll_failed(&self, core: &mut Core, error: Error) {
        warn!("Long-poll failed: {error}");
        core.poll_failures += 1;
        self.disconnect(core);
        self.set_status(core, ConnectStatus::Failed);
    }

    fn update(&self, core: &mut Core, envelope: &Envelope, event_id: Option<String>) {
        if let Some(id) = event_id {
            core.last_event_id = Some(id);
        }
        if let Envelope::KeepAlive { timestamp } = envelope {
            trace!("keep-alive {timestamp}");
            return;
        }
        if core.history.apply(envelope) {
            self.history_tx.send_replace(core.history.clone());
        }
    }

    fn set_status(&self, core: &mut Core, status: ConnectStatus) {
        if core.status != status {
            debug!("Connection status {:?} -> {status:?}", core.status);
        }
        core.status = status;
        self.status_tx.send_replace(status);
    }
}
