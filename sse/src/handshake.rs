//! Welcome / reconnect protocol.
//!
//! Every new reader first asks the publisher side for its view of history
//! (`HistoryRequest` on the channel) and waits for the matching `HistoryReply`.
//! The reply decides between a full resync (`welcome`) and an incremental
//! replay (`chat`). If no reply arrives in time the reader gets an empty `chat`
//! so its transport can proceed instead of hanging.

use crate::connection::{ClientId, ConnectionId};
use crate::subscription::Subscription;
use events::channel::{Channel, ChannelMessage};
use events::clock::{delay_until, duration_ms, Clock, TimerHandle};
use events::message::{ChatMessage, Envelope, TimeMs};
use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Which transport a handshake is for; each has its own deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Stream,
    Poll,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimeouts {
    /// Deadline once the publisher has been seen answering.
    pub reply: Duration,
    /// Poll deadline before the publisher has ever answered.
    pub poll_cold_start: Duration,
    /// Snapshot deadline before the publisher has ever answered.
    pub snapshot_cold_start: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            reply: Duration::from_millis(1_500),
            poll_cold_start: Duration::from_millis(15_000),
            snapshot_cold_start: Duration::from_millis(300),
        }
    }
}

impl HandshakeTimeouts {
    pub fn for_kind(&self, kind: HandshakeKind, publisher_active: bool) -> Duration {
        match (kind, publisher_active) {
            (HandshakeKind::Stream, _) | (_, true) => self.reply,
            (HandshakeKind::Poll, false) => self.poll_cold_start,
            (HandshakeKind::Snapshot, false) => self.snapshot_cold_start,
        }
    }
}

/// Receives the handshake's outcome, exactly once, unless it was unsubscribed.
pub type Deliver = Box<dyn FnOnce(Envelope) + Send>;

struct Pending {
    kind: HandshakeKind,
    expire_at: TimeMs,
    client_id: Option<ClientId>,
    last_time: Option<TimeMs>,
    deliver: Deliver,
}

#[derive(Default)]
struct Core {
    pending: HashMap<ConnectionId, Pending>,
    timer: Option<TimerHandle>,
    next_timeout: TimeMs,
    generation: u64,
}

struct Inner {
    clock: Arc<dyn Clock>,
    channel: Arc<dyn Channel>,
    timeouts: HandshakeTimeouts,
    publisher_active: AtomicBool,
    core: Mutex<Core>,
}

#[derive(Clone)]
pub struct HandshakeCoordinator {
    inner: Arc<Inner>,
}

impl HandshakeCoordinator {
    pub fn new(clock: Arc<dyn Clock>, channel: Arc<dyn Channel>, timeouts: HandshakeTimeouts) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                channel,
                timeouts,
                publisher_active: AtomicBool::new(false),
                core: Mutex::new(Core::default()),
            }),
        }
    }

    /// Starts a handshake and asks the publisher side for history.
    pub fn begin(
        &self,
        kind: HandshakeKind,
        client_id: Option<ClientId>,
        last_time: Option<TimeMs>,
        deliver: Deliver,
    ) -> Subscription {
        let id = ConnectionId::new();
        let timeout = self.inner.timeouts.for_kind(kind, self.is_publisher_active());
        {
            let mut core = self.inner.core();
            let now = self.inner.clock.now_ms();
            core.pending.insert(
                id.clone(),
                Pending {
                    kind,
                    expire_at: now + duration_ms(timeout),
                    client_id,
                    last_time,
                    deliver,
                },
            );
            self.inner.schedule(&mut core, now);
        }
        debug!(
            "Handshake {id} ({kind:?}) waiting up to {}ms for the publisher",
            timeout.as_millis()
        );

        // Posted outside the lock: an in-process publisher replies synchronously.
        self.inner.channel.post(ChannelMessage::HistoryRequest {
            id: id.to_string(),
            last_time,
        });

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || weak.upgrade().is_some_and(|inner| inner.take(&id).is_some()))
    }

    /// Completes the handshake `id` with the publisher's history (newest-first).
    /// Replies for unknown or already finished handshakes are ignored.
    pub fn receive_reply(&self, id: &str, lower_bound: TimeMs, messages: Vec<ChatMessage>) {
        self.inner.publisher_active.store(true, Ordering::Release);

        let Some(pending) = self.inner.take(&ConnectionId::from(id)) else {
            debug!("Ignoring history reply for finished handshake {id}");
            return;
        };

        let envelope = decide(
            self.inner.clock.now_ms(),
            pending.client_id,
            pending.last_time,
            lower_bound,
            messages,
        );
        debug!(
            "Handshake {id} ({:?}) answered with {} message(s) as {}",
            pending.kind,
            envelope.messages().len(),
            events::message::EventType::event_type(&envelope)
        );
        (pending.deliver)(envelope);
    }

    pub fn is_publisher_active(&self) -> bool {
        self.inner.publisher_active.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.core().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chooses between resync and replay.
///
/// A reader whose `last_time` is at or after the publisher's `lower_bound`
/// provably has everything older, so it only gets the newer messages. Anyone
/// else gets a `welcome` with the full history, reusing its client id if it
/// supplied one.
pub fn decide(
    now: TimeMs,
    client_id: Option<ClientId>,
    last_time: Option<TimeMs>,
    lower_bound: TimeMs,
    newest_first: Vec<ChatMessage>,
) -> Envelope {
    match last_time {
        Some(last) if last >= lower_bound => {
            let newer: Vec<ChatMessage> = newest_first
                .into_iter()
                .take_while(|message| message.timestamp > last)
                .collect();
            let timestamp = newer.first().map_or(last, |newest| newest.timestamp);
            Envelope::chat(newer, timestamp, client_id)
        }
        _ => {
            let timestamp = newest_first.first().map_or(now, |newest| newest.timestamp);
            let id = client_id.unwrap_or_else(|| ConnectionId::new().to_string());
            Envelope::welcome(newest_first, timestamp, id)
        }
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, id: &ConnectionId) -> Option<Pending> {
        let mut core = self.core();
        let pending = core.pending.remove(id)?;
        if core.pending.is_empty() {
            self.stop(&mut core);
        }
        Some(pending)
    }

    fn stop(&self, core: &mut Core) {
        core.generation += 1;
        core.next_timeout = 0;
        if let Some(handle) = core.timer.take() {
            self.clock.cancel(handle);
        }
    }

    fn schedule(self: &Arc<Self>, core: &mut Core, now: TimeMs) {
        let Some(next) = core.pending.values().map(|pending| pending.expire_at).min() else {
            self.stop(core);
            return;
        };
        if core.timer.is_some() && core.next_timeout <= next {
            return;
        }

        self.stop(core);
        let generation = core.generation;
        let weak = Arc::downgrade(self);
        core.next_timeout = next;
        core.timer = Some(self.clock.after(
            delay_until(now, next),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep(generation);
                }
            }),
        ));
    }

    fn sweep(self: &Arc<Self>, generation: u64) {
        let expired: Vec<(ConnectionId, Pending)> = {
            let mut core = self.core();
            if core.generation != generation {
                return;
            }
            core.timer = None;

            let now = self.clock.now_ms();
            let due: Vec<ConnectionId> = core
                .pending
                .iter()
                .filter(|(_, pending)| pending.expire_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            let expired = due
                .into_iter()
                .filter_map(|id| core.pending.remove(&id).map(|pending| (id, pending)))
                .collect();
            self.schedule(&mut core, now);
            expired
        };

        for (id, pending) in expired {
            warn!(
                "Handshake {id} ({:?}) timed out waiting for the publisher",
                pending.kind
            );
            (pending.deliver)(Envelope::unavailable(pending.client_id));
        }
    }
}
