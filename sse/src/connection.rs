use crate::message::StreamEvent;
use crate::subscription::Subscription;
use events::clock::{Clock, TimerHandle};
use log::*;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Identity a reader keeps across reconnects (assigned at welcome time).
pub type ClientId = String;

/// Unique identifier for a registration (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

/// The receiving end of a push subscriber has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Where a push subscriber's events go. Borrowed by the registry, owned by the transport.
pub trait PushSink: Send + Sync {
    fn send(&self, event: StreamEvent) -> Result<(), SinkClosed>;
}

impl PushSink for UnboundedSender<StreamEvent> {
    fn send(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        UnboundedSender::send(self, event).map_err(|_| SinkClosed)
    }
}

/// Transitions reported by a [`PushRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    /// The last subscriber left; keep-alives are no longer needed.
    Idle,
    /// The first subscriber arrived; keep-alives are needed.
    Running,
    /// An event reached at least one subscriber.
    MessageSent,
}

/// Produces the first event for a new subscriber, evaluated when the scheduled add runs.
pub type InitialPayload = Box<dyn FnOnce() -> Option<StreamEvent> + Send>;

struct Receiver {
    client_id: ClientId,
    sink: Arc<dyn PushSink>,
}

#[derive(Default)]
struct Core {
    receivers: HashMap<ConnectionId, Receiver>,
    pending: HashMap<ConnectionId, TimerHandle>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    on_change: Box<dyn Fn(RegistryChange) + Send + Sync>,
    core: Mutex<Core>,
}

/// Live push subscribers and their fan-out.
///
/// Adding a subscriber is deferred to the next tick: the initial payload is
/// computed and sent, then the subscriber is registered, so it never observes
/// a half-built setup. Change notifications are issued while the registry's
/// lock is held, which keeps `Running` and `Idle` strictly ordered.
#[derive(Clone)]
pub struct PushRegistry {
    inner: Arc<Inner>,
}

impl PushRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        on_change: impl Fn(RegistryChange) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                on_change: Box::new(on_change),
                core: Mutex::new(Core::default()),
            }),
        }
    }

    /// Schedules delivery of `initial` followed by registration of `sink`.
    ///
    /// Unsubscribing before the scheduled add runs cancels it entirely.
    pub fn add(
        &self,
        sink: Arc<dyn PushSink>,
        client_id: ClientId,
        initial: InitialPayload,
    ) -> Subscription {
        let id = ConnectionId::new();
        let receiver = Receiver { client_id, sink };

        // Held while scheduling so the task can't look for its pending entry too early.
        let mut core = self.inner.core();
        let weak = Arc::downgrade(&self.inner);
        let task_id = id.clone();
        let handle = self.inner.clock.after(
            Duration::ZERO,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.register(task_id, receiver, initial);
                }
            }),
        );
        core.pending.insert(id.clone(), handle);
        drop(core);

        debug!("Scheduled push subscriber {id}");
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || weak.upgrade().is_some_and(|inner| inner.unsubscribe(&id)))
    }

    /// Sends `data` to every registered subscriber. Subscribers whose sink has
    /// closed are dropped. Returns how many subscribers received it.
    pub fn send(&self, data: &str, event_id: Option<&str>) -> usize {
        let targets: Vec<(ConnectionId, Arc<dyn PushSink>)> = self
            .inner
            .core()
            .receivers
            .iter()
            .map(|(id, receiver)| (id.clone(), Arc::clone(&receiver.sink)))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let event = StreamEvent::new(data, event_id.map(str::to_owned));
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in targets {
            match sink.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(SinkClosed) => {
                    warn!("Failed to send event to push subscriber {id}. Subscriber will be dropped.");
                    closed.push(id);
                }
            }
        }
        (self.inner.on_change)(RegistryChange::MessageSent);

        for id in closed {
            self.inner.unsubscribe(&id);
        }
        delivered
    }

    pub fn unsubscribe(&self, id: &ConnectionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.inner.core().receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of adds still waiting for their scheduled tick.
    pub fn pending_len(&self) -> usize {
        self.inner.core().pending.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner
            .core()
            .receivers
            .values()
            .map(|receiver| receiver.client_id.clone())
            .collect()
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: ConnectionId, receiver: Receiver, initial: InitialPayload) {
        let mut core = self.core();
        if core.pending.remove(&id).is_none() {
            return;
        }

        if let Some(event) = initial() {
            if receiver.sink.send(event).is_err() {
                warn!("Push subscriber {id} closed before its initial event");
                return;
            }
        }

        let was_empty = core.receivers.is_empty();
        info!(
            "Registered push subscriber {id} for client {}",
            receiver.client_id
        );
        core.receivers.insert(id, receiver);
        if was_empty {
            (self.on_change)(RegistryChange::Running);
        }
    }

    fn unsubscribe(&self, id: &ConnectionId) -> bool {
        let mut core = self.core();
        if let Some(handle) = core.pending.remove(id) {
            self.clock.cancel(handle);
            debug!("Cancelled scheduled push subscriber {id}");
            return true;
        }

        if core.receivers.remove(id).is_none() {
            return false;
        }
        info!("Unregistered push subscriber {id}");
        if core.receivers.is_empty() {
            (self.on_change)(RegistryChange::Idle);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::clock::ManualClock;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: PushRegistry,
        changes: Arc<Mutex<Vec<RegistryChange>>>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&changes);
        let registry = PushRegistry::new(clock.clone(), move |change| log.lock().unwrap().push(change));
        Fixture {
            clock,
            registry,
            changes,
        }
    }

    fn sink() -> (Arc<dyn PushSink>, UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(tx), rx)
    }

    fn initial(data: &str) -> InitialPayload {
        let event = StreamEvent::new(data, Some("1".into()));
        Box::new(move || Some(event))
    }

    #[test]
    fn add_is_deferred_to_the_next_tick() {
        let f = fixture();
        let (tx, mut rx) = sink();

        let _subscription = f.registry.add(tx, "client-a".into(), initial("hello"));

        assert!(rx.try_recv().is_err(), "nothing is sent within the caller's frame");
        assert_eq!(f.registry.len(), 0);
        assert_eq!(f.registry.pending_len(), 1);

        f.clock.run_due();

        assert_eq!(rx.try_recv().unwrap().data, "hello");
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.client_ids(), vec!["client-a".to_string()]);
        assert_eq!(*f.changes.lock().unwrap(), vec![RegistryChange::Running]);
    }

    #[test]
    fn unsubscribe_before_the_tick_cancels_the_add() {
        let f = fixture();
        let (tx, mut rx) = sink();

        let subscription = f.registry.add(tx, "client-a".into(), initial("hello"));
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());

        f.clock.run_due();

        assert!(rx.try_recv().is_err(), "a cancelled add sends nothing");
        assert_eq!(f.registry.len(), 0);
        assert!(f.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn send_fans_out_and_reports_once() {
        let f = fixture();
        let (tx_a, mut rx_a) = sink();
        let (tx_b, mut rx_b) = sink();
        let _a = f.registry.add(tx_a, "a".into(), Box::new(|| None));
        let _b = f.registry.add(tx_b, "b".into(), Box::new(|| None));
        f.clock.run_due();

        assert_eq!(f.registry.send("payload", Some("42")), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.data, "payload");
            assert_eq!(event.id.as_deref(), Some("42"));
        }
        assert_eq!(
            *f.changes.lock().unwrap(),
            vec![RegistryChange::Running, RegistryChange::MessageSent]
        );
    }

    #[test]
    fn send_without_subscribers_is_a_no_op() {
        let f = fixture();

        assert_eq!(f.registry.send("payload", None), 0);
        assert!(f.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn idle_fires_only_when_the_last_subscriber_leaves() {
        let f = fixture();
        let (tx_a, _rx_a) = sink();
        let (tx_b, _rx_b) = sink();
        let a = f.registry.add(tx_a, "a".into(), Box::new(|| None));
        let b = f.registry.add(tx_b, "b".into(), Box::new(|| None));
        f.clock.run_due();

        assert!(a.unsubscribe());
        assert_eq!(*f.changes.lock().unwrap(), vec![RegistryChange::Running]);

        assert!(b.unsubscribe());
        assert!(!b.unsubscribe(), "unsubscribing twice is a no-op");
        assert_eq!(
            *f.changes.lock().unwrap(),
            vec![RegistryChange::Running, RegistryChange::Idle]
        );
    }

    #[test]
    fn closed_sinks_are_dropped_during_send() {
        let f = fixture();
        let (tx_a, rx_a) = sink();
        let (tx_b, mut rx_b) = sink();
        let _a = f.registry.add(tx_a, "a".into(), Box::new(|| None));
        let _b = f.registry.add(tx_b, "b".into(), Box::new(|| None));
        f.clock.run_due();
        drop(rx_a);

        assert_eq!(f.registry.send("payload", None), 1);

        assert_eq!(rx_b.try_recv().unwrap().data, "payload");
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn dropping_the_subscription_unregisters() {
        let f = fixture();
        let (tx, _rx) = sink();
        let subscription = f.registry.add(tx, "a".into(), Box::new(|| None));
        f.clock.run_due();

        drop(subscription);

        assert!(f.registry.is_empty());
        assert_eq!(
            *f.changes.lock().unwrap(),
            vec![RegistryChange::Running, RegistryChange::Idle]
        );
    }
}
