//! Connection state machine driven by scripted transports and a manual clock.

use client::error::Error;
use client::transport::{
    PollDone, PollResponse, PollTransport, PushTransport, SignalSink, StreamSignal,
    TransportHandle, TransportRequest,
};
use client::{ClientConnection, ConnectStatus, ConnectionConfig};
use events::clock::ManualClock;
use events::message::{ChatMessage, Envelope, TimeMs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

const START: TimeMs = 1_800_000_000_000;

struct FakeHandle(Arc<AtomicBool>);

impl TransportHandle for FakeHandle {
    fn close(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct OpenedStream {
    request: TransportRequest,
    sink: SignalSink,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakePush {
    opened: Mutex<Vec<OpenedStream>>,
}

impl FakePush {
    fn count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    fn url(&self, index: usize) -> String {
        self.opened.lock().unwrap()[index].request.url.to_string()
    }

    fn is_closed(&self, index: usize) -> bool {
        self.opened.lock().unwrap()[index].closed.load(Ordering::SeqCst)
    }

    fn signal(&self, index: usize, signal: StreamSignal) {
        let sink = Arc::clone(&self.opened.lock().unwrap()[index].sink);
        sink(signal);
    }

    fn deliver(&self, index: usize, envelope: &Envelope) {
        self.signal(
            index,
            StreamSignal::Message {
                data: envelope.to_json().unwrap(),
                event_id: Some(envelope.event_id()),
            },
        );
    }
}

impl PushTransport for FakePush {
    fn open(&self, request: TransportRequest, on_signal: SignalSink) -> Box<dyn TransportHandle> {
        let closed = Arc::new(AtomicBool::new(false));
        self.opened.lock().unwrap().push(OpenedStream {
            request,
            sink: on_signal,
            closed: Arc::clone(&closed),
        });
        Box::new(FakeHandle(closed))
    }
}

struct Fetch {
    request: TransportRequest,
    done: Option<PollDone>,
    closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakePoll {
    fetches: Mutex<Vec<Fetch>>,
}

impl FakePoll {
    fn count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    fn url(&self, index: usize) -> String {
        self.fetches.lock().unwrap()[index].request.url.to_string()
    }

    fn is_closed(&self, index: usize) -> bool {
        self.fetches.lock().unwrap()[index].closed.load(Ordering::SeqCst)
    }

    fn finish(&self, index: usize, result: Result<PollResponse, Error>) {
        let done = self.fetches.lock().unwrap()[index]
            .done
            .take()
            .expect("fetch already finished");
        done(result);
    }

    fn reply(&self, index: usize, envelope: &Envelope) {
        self.finish(
            index,
            Ok(PollResponse {
                status: 200,
                body: envelope.to_json().unwrap(),
            }),
        );
    }
}

impl PollTransport for FakePoll {
    fn fetch(&self, request: TransportRequest, done: PollDone) -> Box<dyn TransportHandle> {
        let closed = Arc::new(AtomicBool::new(false));
        self.fetches.lock().unwrap().push(Fetch {
            request,
            done: Some(done),
            closed: Arc::clone(&closed),
        });
        Box::new(FakeHandle(closed))
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    push: Arc<FakePush>,
    poll: Arc<FakePoll>,
    connection: ClientConnection,
}

fn harness(force_longpoll: bool) -> Harness {
    let clock = Arc::new(ManualClock::new(START));
    let push = Arc::new(FakePush::default());
    let poll = Arc::new(FakePoll::default());
    let mut config = ConnectionConfig::new(Url::parse("http://relay.test").unwrap());
    config.force_longpoll = force_longpoll;
    let connection = ClientConnection::new(config, clock.clone(), push.clone(), poll.clone());
    Harness {
        clock,
        push,
        poll,
        connection,
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn welcome(offsets: &[TimeMs]) -> Envelope {
    let newest_first: Vec<ChatMessage> = offsets
        .iter()
        .rev()
        .map(|offset| ChatMessage::new(START + offset, "alice", format!("m{offset}")))
        .collect();
    let timestamp = newest_first[0].timestamp;
    Envelope::welcome(newest_first, timestamp, "client-1".into())
}

fn chat(offset: TimeMs) -> Envelope {
    let message = ChatMessage::new(START + offset, "bob", format!("m{offset}"));
    Envelope::chat(vec![message], START + offset, None)
}

fn bodies(connection: &ClientConnection) -> Vec<String> {
    connection
        .history()
        .messages()
        .iter()
        .map(|message| message.body.clone())
        .collect()
}

#[test]
fn first_reference_opens_the_event_stream() {
    let h = harness(false);
    assert_eq!(h.connection.status(), ConnectStatus::Idle);

    let _guard = h.connection.acquire();

    assert_eq!(h.push.count(), 1);
    assert_eq!(h.push.url(0), "http://relay.test/api/messages");
    assert_eq!(h.connection.status(), ConnectStatus::Waiting);
    assert_eq!(h.connection.status().code(), 1);
}

#[test]
fn stream_messages_build_the_history() {
    let h = harness(false);
    let _guard = h.connection.acquire();

    h.push.deliver(0, &welcome(&[1, 2]));
    h.push.deliver(0, &chat(3));

    assert_eq!(h.connection.status(), ConnectStatus::Message);
    assert_eq!(bodies(&h.connection), vec!["m3", "m2", "m1"]);
    assert_eq!(h.connection.history().client_id(), Some("client-1"));
    assert_eq!(h.connection.last_event_id(), Some((START + 3).to_string()));
}

#[test]
fn unrecognized_data_is_ignored() {
    let h = harness(false);
    let _guard = h.connection.acquire();

    h.push.signal(
        0,
        StreamSignal::Message {
            data: "{\"kind\":\"bogus\"}".into(),
            event_id: Some("42".into()),
        },
    );

    assert_eq!(h.connection.status(), ConnectStatus::Waiting);
    assert_eq!(h.connection.last_event_id(), None);
    assert!(h.connection.history().messages().is_empty());
}

#[test]
fn silence_cycles_the_connection_with_the_last_event_id() {
    let h = harness(false);
    let _guard = h.connection.acquire();
    h.push.deliver(0, &welcome(&[1]));

    h.clock.advance(ms(19_999));
    assert_eq!(h.push.count(), 1);

    h.clock.advance(ms(1));
    assert!(h.push.is_closed(0));
    assert_eq!(h.push.count(), 2);
    assert_eq!(
        h.push.url(1),
        format!("http://relay.test/api/messages?lastEventId={}", START + 1)
    );
    let reopened = h.push.opened.lock().unwrap()[1].request.clone();
    assert_eq!(reopened.client_id.as_deref(), Some("client-1"));
}

#[test]
fn keep_alives_hold_off_the_deadman() {
    let h = harness(false);
    let _guard = h.connection.acquire();

    for _ in 0..3 {
        h.clock.advance(ms(15_000));
        h.push.deliver(0, &Envelope::keep_alive(START));
    }

    assert_eq!(h.push.count(), 1);
    assert_eq!(h.connection.status(), ConnectStatus::Message);
}

#[test]
fn early_stream_failure_falls_back_to_polling_once() {
    let h = harness(false);
    let _guard = h.connection.acquire();

    h.push.signal(0, StreamSignal::Error { closed: true });
    assert!(h.push.is_closed(0));
    assert_eq!(h.connection.status(), ConnectStatus::Longpoll);
    assert_eq!(h.connection.status().code(), 3);

    // A second error from the abandoned stream changes nothing.
    h.push.signal(0, StreamSignal::Error { closed: true });

    h.clock.run_due();
    h.clock.advance(ms(50));
    assert_eq!(h.push.count(), 1, "no second stream attempt");
    assert_eq!(h.poll.count(), 1);
    assert_eq!(h.poll.url(0), "http://relay.test/api/messages?sseLongPoll=1");
}

#[test]
fn stream_errors_after_a_message_do_not_fall_back() {
    let h = harness(false);
    let _guard = h.connection.acquire();
    h.push.deliver(0, &welcome(&[1]));

    h.push.signal(0, StreamSignal::Error { closed: true });
    h.clock.run_due();

    assert_eq!(h.connection.status(), ConnectStatus::Message);
    assert!(!h.push.is_closed(0));
    assert_eq!(h.poll.count(), 0);
}

#[test]
fn transient_stream_errors_while_waiting_are_tolerated() {
    let h = harness(false);
    let _guard = h.connection.acquire();

    h.push.signal(0, StreamSignal::Error { closed: false });

    assert_eq!(h.connection.status(), ConnectStatus::Waiting);
    assert!(!h.push.is_closed(0));
}

#[test]
fn successful_polls_follow_each_other_quickly() {
    let h = harness(true);
    let _guard = h.connection.acquire();
    assert_eq!(h.connection.status(), ConnectStatus::Longpoll);
    assert_eq!(h.push.count(), 0);

    h.clock.advance(ms(50));
    h.poll.reply(0, &welcome(&[1, 2]));
    assert_eq!(bodies(&h.connection), vec!["m2", "m1"]);

    h.clock.advance(ms(49));
    assert_eq!(h.poll.count(), 1);
    h.clock.advance(ms(1));
    assert_eq!(h.poll.count(), 2);
    assert_eq!(
        h.poll.url(1),
        format!(
            "http://relay.test/api/messages?sseLongPoll=1&lastEventId={}",
            START + 2
        )
    );
}

#[test]
fn unusable_poll_replies_back_off() {
    let h = harness(true);
    let _guard = h.connection.acquire();
    h.clock.advance(ms(50));

    h.poll.finish(
        0,
        Ok(PollResponse {
            status: 503,
            body: String::new(),
        }),
    );

    h.clock.advance(ms(9_999));
    assert_eq!(h.poll.count(), 1);
    h.clock.advance(ms(1));
    assert_eq!(h.poll.count(), 2);
    assert_eq!(h.connection.status(), ConnectStatus::Longpoll);
}

#[test]
fn network_failure_while_polling_is_terminal() {
    let h = harness(true);
    let _guard = h.connection.acquire();
    h.clock.advance(ms(50));

    h.poll.finish(0, Err(Error::Network("connection refused".into())));

    assert_eq!(h.connection.status(), ConnectStatus::Failed);
    assert_eq!(h.connection.status().code(), -1);
    assert!(!h.connection.is_active());
    h.clock.advance(ms(60_000));
    assert_eq!(h.poll.count(), 1, "no automatic retry");
}

#[test]
fn reconnect_after_failure_uses_the_backoff() {
    let h = harness(true);
    let _guard = h.connection.acquire();
    h.clock.advance(ms(50));
    h.poll.finish(0, Err(Error::Network("connection refused".into())));

    h.connection.reconnect();

    assert_eq!(h.connection.status(), ConnectStatus::Longpoll);
    h.clock.advance(ms(50));
    assert_eq!(h.poll.count(), 1);
    h.clock.advance(ms(9_950));
    assert_eq!(h.poll.count(), 2);
}

#[test]
fn releasing_the_last_reference_aborts_the_poll() {
    let h = harness(true);
    let guard = h.connection.acquire();
    h.clock.advance(ms(50));

    drop(guard);
    assert!(h.poll.is_closed(0));
    assert!(!h.connection.is_active());

    // A reply racing the abort is dropped.
    h.poll.reply(0, &welcome(&[1]));
    assert!(h.connection.history().messages().is_empty());
    h.clock.advance(ms(60_000));
    assert_eq!(h.poll.count(), 1);
}

#[test]
fn connection_stays_up_while_any_reference_is_held() {
    let h = harness(false);
    let first = h.connection.acquire();
    let second = h.connection.acquire();
    assert_eq!(h.push.count(), 1, "already active, no second stream");

    drop(first);
    assert!(!h.push.is_closed(0));
    assert!(h.connection.is_active());

    drop(second);
    assert!(h.push.is_closed(0));
    assert!(!h.connection.is_active());

    let _again = h.connection.acquire();
    assert_eq!(h.push.count(), 2);
}

#[test]
fn status_changes_are_observable() {
    let h = harness(false);
    let mut status = h.connection.watch_status();
    let mut history = h.connection.watch_history();

    let _guard = h.connection.acquire();
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), ConnectStatus::Waiting);

    h.push.deliver(0, &welcome(&[1]));
    assert_eq!(*status.borrow_and_update(), ConnectStatus::Message);
    assert!(history.has_changed().unwrap());
    assert_eq!(history.borrow_and_update().messages().len(), 1);
}
