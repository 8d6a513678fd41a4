//! Time and timer capability.
//!
//! Every component that needs "now" or a delayed callback receives an
//! `Arc<dyn Clock>`. Production code uses [`TokioClock`]; tests drive
//! [`ManualClock`] by hand so timer-dependent behavior is deterministic.

use crate::message::TimeMs;
use dashmap::DashMap;
use log::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// A callback scheduled with [`Clock::after`].
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle to a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> TimeMs;

    /// Runs `task` once after `delay`. Never runs it within the caller's frame,
    /// even for a zero delay.
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Cancels a scheduled task. Returns `false` if it already ran or was cancelled.
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// Delay from `now` until `deadline`, clamped at zero.
pub fn delay_until(now: TimeMs, deadline: TimeMs) -> Duration {
    Duration::from_millis(deadline.saturating_sub(now).max(0) as u64)
}

pub fn duration_ms(duration: Duration) -> TimeMs {
    TimeMs::try_from(duration.as_millis()).unwrap_or(TimeMs::MAX)
}

/// Wall clock backed by the tokio timer wheel.
pub struct TokioClock {
    runtime: Handle,
    next_id: AtomicU64,
    timers: Arc<DashMap<u64, Option<AbortHandle>>>,
}

impl TokioClock {
    /// Creates a clock bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            timers: Arc::new(DashMap::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> TimeMs {
        chrono::Utc::now().timestamp_millis()
    }

    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Registered before spawning so a zero delay can't finish first and miss its entry.
        self.timers.insert(id, None);

        let timers = Arc::clone(&self.timers);
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if timers.remove(&id).is_some() {
                task();
            }
        });

        if let Some(mut entry) = self.timers.get_mut(&id) {
            *entry = Some(join.abort_handle());
        }
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        match self.timers.remove(&handle.0) {
            Some((_, abort)) => {
                if let Some(abort) = abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }
}

/// Virtual clock for tests: time only moves when told to.
///
/// Scheduled tasks run in due-time order (ties in scheduling order) from
/// [`ManualClock::advance`], outside of the clock's own lock, so tasks may
/// freely schedule or cancel other tasks.
pub struct ManualClock {
    core: Mutex<ManualCore>,
}

struct ManualCore {
    now: TimeMs,
    next_id: u64,
    queue: BTreeMap<(TimeMs, u64), TimerTask>,
    due_at: HashMap<u64, TimeMs>,
}

impl ManualClock {
    pub fn new(now: TimeMs) -> Self {
        Self {
            core: Mutex::new(ManualCore {
                now,
                next_id: 1,
                queue: BTreeMap::new(),
                due_at: HashMap::new(),
            }),
        }
    }

    fn core(&self) -> std::sync::MutexGuard<'_, ManualCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves time forward by `by`, running every task that falls due on the way.
    pub fn advance(&self, by: Duration) {
        let target = self.now_ms() + duration_ms(by);
        self.advance_to(target);
    }

    /// Moves time forward to `target`, running every task due at or before it.
    pub fn advance_to(&self, target: TimeMs) {
        loop {
            let task = {
                let mut core = self.core();
                let next = core
                    .queue
                    .first_key_value()
                    .map(|(key, _)| *key)
                    .filter(|(due, _)| *due <= target);
                match next {
                    Some(key) => {
                        core.now = core.now.max(key.0);
                        core.due_at.remove(&key.1);
                        core.queue.remove(&key)
                    }
                    None => None,
                }
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        let mut core = self.core();
        core.now = core.now.max(target);
    }

    /// Runs tasks that are already due without moving time.
    pub fn run_due(&self) {
        self.advance(Duration::ZERO);
    }

    pub fn pending(&self) -> usize {
        self.core().queue.len()
    }

    pub fn next_due(&self) -> Option<TimeMs> {
        self.core().queue.first_key_value().map(|((due, _), _)| *due)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimeMs {
        self.core().now
    }

    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let mut core = self.core();
        let id = core.next_id;
        core.next_id += 1;
        let due = core.now + duration_ms(delay);
        core.queue.insert((due, id), task);
        core.due_at.insert(id, due);
        trace!("Scheduled manual timer {id} at {due}");
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut core = self.core();
        match core.due_at.remove(&handle.0) {
            Some(due) => core.queue.remove(&(due, handle.0)).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> TimerTask) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| -> TimerTask {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().unwrap().push(label))
        };
        (log, make)
    }

    #[test]
    fn manual_clock_runs_tasks_in_due_order() {
        let clock = ManualClock::new(1_000);
        let (log, task) = recorder();

        clock.after(Duration::from_millis(300), task("late"));
        clock.after(Duration::from_millis(100), task("early"));
        clock.after(Duration::from_millis(100), task("early-second"));

        clock.advance(Duration::from_millis(99));
        assert!(log.lock().unwrap().is_empty());

        clock.advance(Duration::from_millis(201));
        assert_eq!(*log.lock().unwrap(), vec!["early", "early-second", "late"]);
        assert_eq!(clock.now_ms(), 1_300);
    }

    #[test]
    fn zero_delay_does_not_run_inline() {
        let clock = ManualClock::new(0);
        let (log, task) = recorder();

        clock.after(Duration::ZERO, task("tick"));
        assert!(log.lock().unwrap().is_empty());

        clock.run_due();
        assert_eq!(*log.lock().unwrap(), vec!["tick"]);
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let clock = ManualClock::new(0);
        let (log, task) = recorder();

        let handle = clock.after(Duration::from_millis(10), task("cancelled"));
        assert!(clock.cancel(handle));
        assert!(!clock.cancel(handle), "second cancel is a no-op");

        clock.advance(Duration::from_millis(20));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn tasks_observe_their_due_time_as_now() {
        let clock = Arc::new(ManualClock::new(0));
        let seen = Arc::new(Mutex::new(None));

        let observer = Arc::clone(&clock);
        let slot = Arc::clone(&seen);
        clock.after(
            Duration::from_millis(40),
            Box::new(move || *slot.lock().unwrap() = Some(observer.now_ms())),
        );

        clock.advance(Duration::from_millis(100));
        assert_eq!(*seen.lock().unwrap(), Some(40));
        assert_eq!(clock.now_ms(), 100);
    }

    #[tokio::test]
    async fn tokio_clock_runs_and_cancels() {
        let clock = TokioClock::new();
        let (log, task) = recorder();

        clock.after(Duration::from_millis(5), task("ran"));
        let cancelled = clock.after(Duration::from_millis(5), task("cancelled"));
        assert!(clock.cancel(cancelled));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
        assert_eq!(clock.pending(), 0);
    }
}
