use crate::channel_handler::EngineChannelHandler;
use crate::connection::{ClientId, InitialPayload, PushRegistry, PushSink, RegistryChange};
use crate::error::{Error, ExternalErrorKind};
use crate::handshake::{Deliver, HandshakeCoordinator, HandshakeKind, HandshakeTimeouts};
use crate::history::HistoryStore;
use crate::message::StreamEvent;
use crate::poll::PollRegistry;
use crate::subscription::Subscription;
use events::channel::Channel;
use events::clock::Clock;
use events::idle_timer::IdleTimer;
use events::message::{
    is_time_value, time_from_event_id, ChatMessage, Envelope, TimeMs, MAX_TIME_VALUE,
    MIN_TIME_VALUE,
};
use log::*;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Push keep-alive interval, also the longest a poll is held without messages.
    pub keep_alive: Duration,
    /// How long a poll with pending messages is held to batch them.
    pub longpoll_min_wait: Duration,
    pub handshake: HandshakeTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_millis(15_000),
            longpoll_min_wait: Duration::from_millis(2_000),
            handshake: HandshakeTimeouts::default(),
        }
    }
}

impl EngineConfig {
    /// The engine only needs to bridge reconnect gaps, so it keeps two
    /// keep-alive intervals of history.
    pub fn ring_retention(&self) -> Duration {
        self.keep_alive * 2
    }
}

/// What a transport knows about a reader when it arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_id: Option<ClientId>,
    pub last_event_id: Option<String>,
}

impl ConnectRequest {
    pub fn new(client_id: Option<ClientId>, last_event_id: Option<String>) -> Self {
        Self {
            client_id,
            last_event_id,
        }
    }

    /// The last seen event id as a time value; invalid ids count as absent.
    pub fn last_time(&self) -> Option<TimeMs> {
        time_from_event_id(self.last_event_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub push_subscribers: usize,
    pub pending_push: usize,
    pub pending_polls: usize,
    pub pending_handshakes: usize,
    pub retained_messages: usize,
    pub lower_bound: Option<TimeMs>,
    pub publisher_active: bool,
}

struct Ring {
    store: HistoryStore,
    newest_accepted: TimeMs,
}

#[derive(Default)]
struct StreamSlot {
    closed: bool,
    push: Option<Subscription>,
}

pub(crate) struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ring: Mutex<Ring>,
    push: PushRegistry,
    polls: PollRegistry,
    handshakes: HandshakeCoordinator,
    keep_alive: IdleTimer,
}

/// The distribution engine.
///
/// Receives published messages from the channel, keeps a short ring of recent
/// history, fans messages out to push subscribers and releases pending polls.
/// New readers go through the handshake unless their gap can be proven from
/// the ring alone.
#[derive(Clone)]
pub struct Manager {
    engine: Arc<Engine>,
}

impl Manager {
    pub fn new(clock: Arc<dyn Clock>, channel: Arc<dyn Channel>, config: EngineConfig) -> Self {
        let engine = Arc::new_cyclic(|weak: &Weak<Engine>| {
            let on_idle = weak.clone();
            let keep_alive = IdleTimer::new(Arc::clone(&clock), config.keep_alive, move || {
                if let Some(engine) = on_idle.upgrade() {
                    engine.send_keep_alive();
                }
            });

            let timer = keep_alive.clone();
            let push = PushRegistry::new(Arc::clone(&clock), move |change| match change {
                RegistryChange::Running => timer.start(),
                RegistryChange::Idle => timer.stop(),
                RegistryChange::MessageSent => timer.mark_activity(),
            });

            Engine {
                config,
                ring: Mutex::new(Ring {
                    store: HistoryStore::new(config.ring_retention()),
                    newest_accepted: MIN_TIME_VALUE,
                }),
                push,
                polls: PollRegistry::new(
                    Arc::clone(&clock),
                    config.longpoll_min_wait,
                    config.keep_alive,
                ),
                handshakes: HandshakeCoordinator::new(
                    Arc::clone(&clock),
                    Arc::clone(&channel),
                    config.handshake,
                ),
                keep_alive,
                clock,
            }
        });

        channel.on_message(Arc::new(EngineChannelHandler::new(Arc::downgrade(&engine))));
        Self { engine }
    }

    /// Registers a push reader. Its first event is a `welcome` or `chat` from the
    /// handshake, followed by live `chat` and `keep-alive` events.
    pub fn subscribe(&self, sink: Arc<dyn PushSink>, request: ConnectRequest) -> Subscription {
        let last_time = request.last_time();
        let slot = Arc::new(Mutex::new(StreamSlot::default()));

        let weak = Arc::downgrade(&self.engine);
        let delivered_slot = Arc::clone(&slot);
        let handshake = self.engine.handshakes.begin(
            HandshakeKind::Stream,
            request.client_id,
            last_time,
            Box::new(move |envelope| {
                if let Some(engine) = weak.upgrade() {
                    engine.register_stream(&delivered_slot, sink, envelope, last_time);
                }
            }),
        );

        Subscription::new(move || {
            if handshake.unsubscribe() {
                return true;
            }
            let mut slot = lock(&slot);
            slot.closed = true;
            slot.push.take().is_some_and(|push| push.unsubscribe())
        })
    }

    /// Registers a long-poll reader. `reply` receives exactly one envelope,
    /// unless the poll is unsubscribed first.
    pub fn longpoll(&self, request: ConnectRequest, reply: Deliver) -> Subscription {
        let last_time = request.last_time();

        if let Some(last) = last_time {
            let now = self.engine.clock.now_ms();
            let pending =
                self.engine
                    .ring()
                    .store
                    .count_after(now, last, self.engine.config.longpoll_min_wait);

            if let Some(pending) = pending {
                let weak = Arc::downgrade(&self.engine);
                let client_id = request.client_id;
                return self.engine.polls.add(
                    pending,
                    Box::new(move || {
                        if let Some(engine) = weak.upgrade() {
                            let now = engine.clock.now_ms();
                            let envelope =
                                engine
                                    .ring()
                                    .store
                                    .to_envelope(now, client_id.as_deref(), last);
                            reply(envelope);
                        }
                    }),
                );
            }
        }

        self.engine
            .handshakes
            .begin(HandshakeKind::Poll, request.client_id, last_time, reply)
    }

    /// Server-side rendering of the initial history: resolves to a `welcome`,
    /// or fails when the publisher side doesn't answer in time.
    pub fn snapshot(
        &self,
        client_id: Option<ClientId>,
    ) -> impl Future<Output = Result<Envelope, Error>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let subscription = self.engine.handshakes.begin(
            HandshakeKind::Snapshot,
            client_id,
            None,
            Box::new(move |envelope| {
                let _ = tx.send(envelope);
            }),
        );

        async move {
            let envelope = rx.await?;
            drop(subscription);
            match envelope {
                Envelope::Welcome { .. } => Ok(envelope),
                _ => Err(Error::external(ExternalErrorKind::PublisherUnavailable)),
            }
        }
    }

    pub fn stats(&self) -> Stats {
        let (retained_messages, lower_bound) = {
            let ring = self.engine.ring();
            let lower_bound = ring.store.lower_bound();
            (
                ring.store.len(),
                (lower_bound != MAX_TIME_VALUE).then_some(lower_bound),
            )
        };
        Stats {
            push_subscribers: self.engine.push.len(),
            pending_push: self.engine.push.pending_len(),
            pending_polls: self.engine.polls.len(),
            pending_handshakes: self.engine.handshakes.len(),
            retained_messages,
            lower_bound,
            publisher_active: self.engine.handshakes.is_publisher_active(),
        }
    }
}

impl Engine {
    fn ring(&self) -> MutexGuard<'_, Ring> {
        lock(&self.ring)
    }

    /// Accepts newly published messages, ignoring any not newer than what was
    /// already accepted, then fans them out and releases waiting polls.
    pub(crate) fn receive_published(&self, messages: &[ChatMessage]) {
        let accepted = {
            let mut ring = self.ring();
            let mut accepted: Vec<ChatMessage> = messages
                .iter()
                .filter(|message| {
                    is_time_value(message.timestamp) && message.timestamp > ring.newest_accepted
                })
                .cloned()
                .collect();
            accepted.sort_by_key(|message| message.timestamp);
            accepted.dedup_by_key(|message| message.timestamp);

            let Some(newest) = accepted.last().map(|message| message.timestamp) else {
                debug!("Ignoring {} already accepted message(s)", messages.len());
                return;
            };
            ring.newest_accepted = newest;
            ring.store.append_all(self.clock.now_ms(), accepted.clone());
            accepted
        };

        let count = accepted.len();
        let newest = accepted
            .last()
            .map_or(MIN_TIME_VALUE, |message| message.timestamp);
        let newest_first: Vec<ChatMessage> = accepted.into_iter().rev().collect();
        let delivered = self.broadcast(&Envelope::chat(newest_first, newest, None));
        debug!("Distributed {count} message(s) to {delivered} push subscriber(s)");

        self.polls.mark(count);
    }

    pub(crate) fn receive_history_reply(
        &self,
        id: &str,
        lower_bound: TimeMs,
        messages: Vec<ChatMessage>,
    ) {
        self.handshakes.receive_reply(id, lower_bound, messages);
    }

    fn broadcast(&self, envelope: &Envelope) -> usize {
        match envelope.to_json() {
            Ok(data) => self.push.send(&data, Some(&envelope.event_id())),
            Err(e) => {
                error!("Failed to serialize envelope: {e}");
                0
            }
        }
    }

    fn send_keep_alive(&self) {
        let now = self.clock.now_ms();
        let delivered = self.broadcast(&Envelope::keep_alive(now));
        trace!("Sent keep-alive to {delivered} push subscriber(s)");
        if !self.push.is_empty() {
            self.keep_alive.start();
        }
    }

    fn register_stream(
        self: &Arc<Self>,
        slot: &Mutex<StreamSlot>,
        sink: Arc<dyn PushSink>,
        envelope: Envelope,
        last_time: Option<TimeMs>,
    ) {
        let mut slot = lock(slot);
        if slot.closed {
            return;
        }

        let client_id = envelope.client_id().unwrap_or_default().to_owned();
        let weak = Arc::downgrade(self);
        let initial: InitialPayload = Box::new(move || {
            let envelope = match weak.upgrade() {
                Some(engine) => engine.catch_up(envelope, last_time),
                None => envelope,
            };
            match StreamEvent::from_envelope(&envelope) {
                Ok(event) => Some(event),
                Err(e) => {
                    error!("Failed to serialize initial envelope: {e}");
                    None
                }
            }
        });
        slot.push = Some(self.push.add(sink, client_id, initial));
    }

    /// Adds ring messages that arrived after the handshake reply was produced.
    fn catch_up(&self, mut envelope: Envelope, last_time: Option<TimeMs>) -> Envelope {
        if matches!(envelope, Envelope::KeepAlive { .. }) || envelope.timestamp() == MIN_TIME_VALUE {
            return envelope;
        }
        let after = if matches!(envelope, Envelope::Welcome { .. }) {
            envelope.newest_message_timestamp()
        } else {
            envelope.newest_message_timestamp().or(last_time)
        };

        let newer = self.ring().store.slice_after(after);
        if !newer.is_empty() {
            debug!("Catching up {} message(s) on registration", newer.len());
            envelope.extend_newer(newer);
        }
        envelope
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
