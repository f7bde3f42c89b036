//! Sticky event flag with directed propagation links.
//!
//! Once [`Event::set`] fires, every current and future waiter observes the
//! flag until [`Event::clear`]. Events can be linked into a directed
//! graph: setting one sets every peer reachable through `link`, depth
//! first in registration order. Setting an already-set event is a no-op,
//! which makes propagation through cycles terminate.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::sync::condition::Condition;
use crate::sync::semaphore::AcquireError;

struct Links {
    to: SmallVec<[Weak<EventInner>; 2]>,
    from: SmallVec<[Weak<EventInner>; 2]>,
}

struct EventInner {
    flag: AtomicBool,
    condition: Condition,
    links: Mutex<Links>,
}

fn set_inner(inner: &EventInner) {
    if inner.flag.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.condition.notify_all();
    let peers: SmallVec<[Arc<EventInner>; 2]> = inner
        .links
        .lock()
        .to
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for peer in peers {
        set_inner(&peer);
    }
}

fn remove_one(list: &mut SmallVec<[Weak<EventInner>; 2]>, target: &Weak<EventInner>) {
    if let Some(pos) = list.iter().position(|w| w.ptr_eq(target)) {
        list.remove(pos);
    }
}

/// A sticky flag for coroutines of one event loop.
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Creates an unset event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                flag: AtomicBool::new(false),
                condition: Condition::new(),
                links: Mutex::new(Links {
                    to: SmallVec::new(),
                    from: SmallVec::new(),
                }),
            }),
        }
    }

    /// Sets the flag, wakes every waiter, and propagates through the link
    /// graph. Idempotent on a set event.
    pub fn set(&self) {
        set_inner(&self.inner);
    }

    /// Resets the flag. Does not wake anyone; later waiters park until the
    /// next [`set`](Self::set).
    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    /// The current flag value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Parks the calling coroutine until the flag is set.
    pub fn wait(&self) -> Result<(), AcquireError> {
        while !self.inner.flag.load(Ordering::SeqCst) {
            self.inner.condition.wait()?;
        }
        Ok(())
    }

    /// Number of coroutines parked on this event.
    #[must_use]
    pub fn getting(&self) -> usize {
        self.inner.condition.getting()
    }

    /// Adds a propagation edge: setting `self` will also set `other`.
    pub fn link(&self, other: &Event) {
        self.inner
            .links
            .lock()
            .to
            .push(Arc::downgrade(&other.inner));
        other
            .inner
            .links
            .lock()
            .from
            .push(Arc::downgrade(&self.inner));
    }

    /// Removes one propagation edge added by [`link`](Self::link).
    pub fn unlink(&self, other: &Event) {
        remove_one(&mut self.inner.links.lock().to, &Arc::downgrade(&other.inner));
        remove_one(
            &mut other.inner.links.lock().from,
            &Arc::downgrade(&self.inner),
        );
    }

    /// Tears the event down: waiters of a never-set event fail with
    /// [`AcquireError::Closed`], and all link edges are severed on both
    /// sides. Idempotent.
    pub fn close(&self) {
        if !self.inner.flag.load(Ordering::SeqCst) && self.inner.condition.getting() > 0 {
            self.inner.condition.close();
        }
        let (to, from) = {
            let mut links = self.inner.links.lock();
            (
                std::mem::take(&mut links.to),
                std::mem::take(&mut links.from),
            )
        };
        let this = Arc::downgrade(&self.inner);
        for peer in from.iter().filter_map(Weak::upgrade) {
            remove_one(&mut peer.links.lock().to, &this);
        }
        for peer in to.iter().filter_map(Weak::upgrade) {
            remove_one(&mut peer.links.lock().from, &this);
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.is_set())
            .field("waiters", &self.getting())
            .finish()
    }
}

/// An [`Event`] carrying a value: `send` stores the value and sets the
/// event; waiters receive a clone.
pub struct ValueEvent<T> {
    event: Event,
    value: Mutex<Option<T>>,
}

impl<T: Clone> ValueEvent<T> {
    /// Creates an empty, unset value event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            event: Event::new(),
            value: Mutex::new(None),
        }
    }

    /// Stores `value` and sets the event, waking every waiter.
    pub fn send(&self, value: T) {
        *self.value.lock() = Some(value);
        self.event.set();
    }

    /// Parks the calling coroutine until a value is sent, then returns a
    /// clone of it.
    pub fn wait(&self) -> Result<T, AcquireError> {
        self.event.wait()?;
        self.value.lock().clone().ok_or(AcquireError::Closed)
    }

    /// Removes and returns the stored value, leaving the flag untouched.
    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// True once a value was sent and not cleared.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.event.is_set()
    }

    /// Clears both the flag and the stored value.
    pub fn clear(&self) {
        *self.value.lock() = None;
        self.event.clear();
    }

    /// Number of coroutines parked on this event.
    #[must_use]
    pub fn getting(&self) -> usize {
        self.event.getting()
    }
}

impl<T: Clone> Default for ValueEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ValueEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueEvent")
            .field("set", &self.event.is_set())
            .field("has_value", &self.value.lock().is_some())
            .finish()
    }
}
