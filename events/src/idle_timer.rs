use crate::clock::{duration_ms, Clock, TimerHandle};
use crate::message::TimeMs;
use log::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Fires an action once nothing has happened for `max_idle`.
///
/// Activity is only recorded, never used to reset the timer. When the timer
/// fires it checks how long ago the last activity was: with budget left it
/// reschedules itself for the remainder, otherwise it runs the action and
/// stops. A steady stream of activity therefore costs one wake-up per window
/// instead of a cancel and re-arm per event.
#[derive(Clone)]
pub struct IdleTimer {
    inner: Arc<Inner>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    max_idle: Duration,
    action: Box<dyn Fn() + Send + Sync>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    last_activity: TimeMs,
    timer: Option<TimerHandle>,
    generation: u64,
}

impl IdleTimer {
    pub fn new(
        clock: Arc<dyn Clock>,
        max_idle: Duration,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                max_idle,
                action: Box::new(action),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Records activity and arms the timer if it isn't already armed.
    pub fn start(&self) {
        let mut state = self.inner.state();
        state.last_activity = self.inner.clock.now_ms();
        if state.timer.is_none() {
            self.inner.arm(&mut state, self.inner.max_idle);
        }
    }

    /// Records activity without touching the timer.
    pub fn mark_activity(&self) {
        self.inner.state().last_activity = self.inner.clock.now_ms();
    }

    pub fn stop(&self) {
        let mut state = self.inner.state();
        state.generation += 1;
        if let Some(handle) = state.timer.take() {
            self.inner.clock.cancel(handle);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().timer.is_some()
    }

    pub fn max_idle(&self) -> Duration {
        self.inner.max_idle
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(self: &Arc<Self>, state: &mut State, delay: Duration) {
        state.generation += 1;
        let generation = state.generation;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = self.clock.after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire(generation);
                }
            }),
        );
        state.timer = Some(handle);
    }

    fn fire(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state();
            if state.generation != generation || state.timer.is_none() {
                return;
            }
            state.timer = None;

            let idle_for = self.clock.now_ms() - state.last_activity;
            let remaining = duration_ms(self.max_idle) - idle_for;
            if remaining > 0 {
                trace!("Idle timer rescheduled for the remaining {remaining}ms");
                self.arm(&mut state, Duration::from_millis(remaining as u64));
                return;
            }
        }
        debug!("Idle for {}ms, running idle action", self.max_idle.as_millis());
        (self.action)();
    }
}
