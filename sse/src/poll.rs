//! Pending long-poll requests and their release schedule.
//!
//! A poll that already has messages waiting is held for `min_wait` so quick
//! successive messages are batched into one reply. A poll with nothing waiting
//! is held for `max_wait` and then released anyway, which bounds how long a
//! reader can go without hearing from the server. One sweep timer serves the
//! whole registry, always aimed at the earliest outstanding release time.

use crate::connection::ConnectionId;
use crate::subscription::Subscription;
use events::clock::{delay_until, duration_ms, Clock, TimerHandle};
use events::message::TimeMs;
use log::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Called exactly once when a poll is released. Never called for a poll that
/// was unsubscribed.
pub type ReleasePoll = Box<dyn FnOnce() + Send>;

struct Poll {
    id: ConnectionId,
    release: ReleasePoll,
    arrived_at: TimeMs,
    pending: usize,
}

#[derive(Default)]
struct Core {
    // Insertion order, so `arrived_at` never decreases.
    polls: Vec<Poll>,
    timer: Option<TimerHandle>,
    next_sweep: TimeMs,
    generation: u64,
}

struct Inner {
    clock: Arc<dyn Clock>,
    min_wait_ms: TimeMs,
    max_wait_ms: TimeMs,
    core: Mutex<Core>,
}

#[derive(Clone)]
pub struct PollRegistry {
    inner: Arc<Inner>,
}

impl PollRegistry {
    pub fn new(clock: Arc<dyn Clock>, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                min_wait_ms: duration_ms(min_wait),
                max_wait_ms: duration_ms(max_wait),
                core: Mutex::new(Core::default()),
            }),
        }
    }

    /// Holds a poll that already knows of `pending` unsent messages.
    pub fn add(&self, pending: usize, release: ReleasePoll) -> Subscription {
        let id = ConnectionId::new();
        {
            let mut core = self.inner.core();
            core.polls.push(Poll {
                id: id.clone(),
                release,
                arrived_at: self.inner.clock.now_ms(),
                pending,
            });
            self.inner.schedule_sweep(&mut core);
        }
        debug!("Holding poll {id} with {pending} pending message(s)");

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || weak.upgrade().is_some_and(|inner| inner.unsubscribe(&id)))
    }

    /// Records `count` new messages for every pending poll and releases those
    /// already held past `min_wait`.
    pub fn mark(&self, count: usize) {
        let released = {
            let mut core = self.inner.core();
            let now = self.inner.clock.now_ms();
            for poll in core.polls.iter_mut() {
                poll.pending += count;
            }
            let min_wait_ms = self.inner.min_wait_ms;
            let released = take_where(&mut core.polls, |poll| {
                poll.pending > 0 && now > poll.arrived_at + min_wait_ms
            });
            self.inner.schedule_sweep(&mut core);
            released
        };
        release_all(released);
    }

    /// Removes a poll without releasing it.
    pub fn unsubscribe(&self, id: &ConnectionId) -> bool {
        self.inner.unsubscribe(id)
    }

    pub fn len(&self) -> usize {
        self.inner.core().polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond_by(&self, poll: &Poll) -> TimeMs {
        poll.arrived_at
            + if poll.pending < 1 {
                self.max_wait_ms
            } else {
                self.min_wait_ms
            }
    }

    fn unsubscribe(self: &Arc<Self>, id: &ConnectionId) -> bool {
        let mut core = self.core();
        let Some(index) = core.polls.iter().position(|poll| &poll.id == id) else {
            return false;
        };
        core.polls.remove(index);
        self.schedule_sweep(&mut core);
        debug!("Dropped poll {id}");
        true
    }

    fn stop(&self, core: &mut Core) {
        core.generation += 1;
        core.next_sweep = 0;
        if let Some(handle) = core.timer.take() {
            self.clock.cancel(handle);
        }
    }

    fn schedule_sweep(self: &Arc<Self>, core: &mut Core) {
        let Some(respond_by) = core.polls.iter().map(|poll| self.respond_by(poll)).min() else {
            self.stop(core);
            return;
        };

        let now = self.clock.now_ms();
        if core.timer.is_some() && core.next_sweep == respond_by && now < respond_by {
            return;
        }

        self.stop(core);
        let generation = core.generation;
        let weak = Arc::downgrade(self);
        core.next_sweep = respond_by;
        core.timer = Some(self.clock.after(
            delay_until(now, respond_by),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep(generation);
                }
            }),
        ));
    }

    fn sweep(self: &Arc<Self>, generation: u64) {
        let released = {
            let mut core = self.core();
            if core.generation != generation {
                return;
            }
            core.timer = None;
            core.next_sweep = 0;

            let now = self.clock.now_ms();
            let released = take_where(&mut core.polls, |poll| now >= self.respond_by(poll));
            self.schedule_sweep(&mut core);
            released
        };
        release_all(released);
    }
}

fn take_where(polls: &mut Vec<Poll>, mut due: impl FnMut(&Poll) -> bool) -> Vec<Poll> {
    let (released, kept): (Vec<Poll>, Vec<Poll>) = polls.drain(..).partition(|poll| due(poll));
    *polls = kept;
    released
}

fn release_all(polls: Vec<Poll>) {
    for poll in polls {
        debug!("Releasing poll {} ({} pending)", poll.id, poll.pending);
        (poll.release)();
    }
}
