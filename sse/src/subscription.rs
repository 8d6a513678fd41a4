use std::fmt;
use std::sync::{Mutex, PoisonError};

type Cancel = Box<dyn FnOnce() -> bool + Send>;

/// Handle returned by every registration (push subscriber, pending poll,
/// pending handshake).
///
/// `unsubscribe` is idempotent: it returns `true` only if the registration was
/// still live and has now been removed. Dropping the handle unsubscribes, so
/// a transport that goes away simply drops it.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    cancel: Mutex<Option<Cancel>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() -> bool + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn unsubscribe(&self) -> bool {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        cancel.is_some_and(|cancel| cancel())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("Subscription").field("live", &live).finish()
    }
}
