//! One-shot triggerable wait handles.
//!
//! Every suspension point in a context (window waits, frame waits, activation
//! ordering, remote round trips, view construction) is a [`UserEvent`] that
//! some other thread triggers exactly once. Waiters either block on
//! [`Event::wait`] or register a callback with [`Event::on_trigger`]; the
//! callback runs on the triggering thread after the state lock is released.
//!
//! [`Event::NONE`] is the always-triggered event, used wherever "no
//! precondition" is meant.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

type Callback = Box<dyn FnOnce() + Send>;

/// Opaque name of an event, as carried across the wire.
///
/// The zero id names [`Event::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl EventId {
    /// The id of the always-triggered event.
    pub const NONE: Self = Self(0);

    /// True for the always-triggered event.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

struct EventState {
    triggered: bool,
    callbacks: SmallVec<[Callback; 2]>,
}

struct EventInner {
    id: EventId,
    state: Mutex<EventState>,
    cond: Condvar,
}

/// A waitable one-shot event.
#[derive(Clone)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

impl Event {
    /// The event that has always already triggered.
    pub const NONE: Self = Self { inner: None };

    /// Returns the wire id of this event.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.inner.as_ref().map_or(EventId::NONE, |inner| inner.id)
    }

    /// True if this is [`Event::NONE`].
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.inner.is_none()
    }

    /// True once the event has triggered.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|inner| inner.state.lock().triggered)
    }

    /// Blocks the calling thread until the event triggers.
    pub fn wait(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut state = inner.state.lock();
        while !state.triggered {
            inner.cond.wait(&mut state);
        }
    }

    /// Runs `callback` once the event has triggered.
    ///
    /// If the event already triggered the callback runs immediately on the
    /// calling thread.
    pub fn on_trigger(&self, callback: impl FnOnce() + Send + 'static) {
        let Some(inner) = &self.inner else {
            callback();
            return;
        };
        {
            let mut state = inner.state.lock();
            if !state.triggered {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Returns an event that triggers once every event in `events` has.
    #[must_use]
    pub fn merge<I>(events: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let pending: Vec<Self> = events
            .into_iter()
            .filter(|event| !event.has_triggered())
            .collect();
        match pending.len() {
            0 => Self::NONE,
            1 => pending.into_iter().next().unwrap_or(Self::NONE),
            n => {
                let merged = UserEvent::new();
                let remaining = Arc::new(AtomicU64::new(n as u64));
                for event in pending {
                    let merged = merged.clone();
                    let remaining = Arc::clone(&remaining);
                    event.on_trigger(move || {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            merged.trigger();
                        }
                    });
                }
                merged.event()
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::NONE
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id().0)
            .field("triggered", &self.has_triggered())
            .finish()
    }
}

/// An event that the holder triggers explicitly.
#[derive(Clone, PartialEq, Eq)]
pub struct UserEvent {
    event: Event,
}

impl UserEvent {
    /// Creates an untriggered event.
    #[must_use]
    pub fn new() -> Self {
        let id = EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            event: Event {
                inner: Some(Arc::new(EventInner {
                    id,
                    state: Mutex::new(EventState {
                        triggered: false,
                        callbacks: SmallVec::new(),
                    }),
                    cond: Condvar::new(),
                })),
            },
        }
    }

    /// Returns the waitable side of this event.
    #[must_use]
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Triggers the event, waking all waiters and running callbacks.
    ///
    /// Triggering twice is a no-op.
    pub fn trigger(&self) {
        let Some(inner) = &self.event.inner else {
            return;
        };
        let callbacks = {
            let mut state = inner.state.lock();
            if state.triggered {
                return;
            }
            state.triggered = true;
            std::mem::take(&mut state.callbacks)
        };
        inner.cond.notify_all();
        for callback in callbacks {
            callback();
        }
    }

    /// True once triggered.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        self.event.has_triggered()
    }

    /// Blocks until triggered.
    pub fn wait(&self) {
        self.event.wait();
    }
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UserEvent").field(&self.event).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn none_is_triggered() {
        assert!(Event::NONE.has_triggered());
        Event::NONE.wait();
        assert!(Event::NONE.id().is_none());
    }

    #[test]
    fn trigger_wakes_waiter() {
        let user = UserEvent::new();
        let event = user.event();
        let waiter = thread::spawn(move || {
            event.wait();
            event.has_triggered()
        });
        thread::sleep(Duration::from_millis(10));
        user.trigger();
        assert!(waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn callbacks_run_once() {
        let user = UserEvent::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        user.event().on_trigger(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        user.trigger();
        user.trigger();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Late registration runs immediately.
        let h = Arc::clone(&hits);
        user.event().on_trigger(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn merge_waits_for_all() {
        let a = UserEvent::new();
        let b = UserEvent::new();
        let merged = Event::merge([a.event(), b.event(), Event::NONE]);
        assert!(!merged.has_triggered());
        a.trigger();
        assert!(!merged.has_triggered());
        b.trigger();
        assert!(merged.has_triggered());
    }

    #[test]
    fn merge_of_triggered_is_none() {
        let a = UserEvent::new();
        a.trigger();
        assert!(Event::merge([a.event(), Event::NONE]).is_none());
        let b = UserEvent::new();
        assert_eq!(Event::merge([b.event()]), b.event());
    }
}
