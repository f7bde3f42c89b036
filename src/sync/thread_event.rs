//! Cross-thread sticky event with per-event-loop fan-out.
//!
//! [`ThreadEvent`] is the one primitive that crosses OS threads. Waiters
//! come in two classes: coroutines, which park on a per-event-loop
//! [`Condition`] (a `Hold`), and plain threads with no loop, which block
//! on an OS condvar. `set` fans the wake-up out to every hold (directly
//! when the hold belongs to the calling thread's loop, through a
//! thread-safe deferred callback otherwise) and then wakes the condvar.
//!
//! # Lifetime protocol
//!
//! Memory safety is carried by `Arc`; the `refs` counter carries the
//! teardown protocol: 1 for the public handle plus one per in-flight
//! `wait`/`notify`. Waiters park while the flag is unset *and* `refs > 1`;
//! closing the handle drops its contribution and issues a final fan-out
//! (without a bump of its own) so a parked waiter observes `refs == 1`
//! and exits with the flag it saw.

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::runtime::event_loop::LoopInner;
use crate::runtime::{EventLoop, LoopId};
use crate::sync::condition::Condition;
use crate::sync::semaphore::AcquireError;
use crate::tracing_compat::trace;

struct Hold {
    loop_id: LoopId,
    event_loop: Weak<LoopInner>,
    condition: Arc<Condition>,
}

struct TeState {
    holds: SmallVec<[Hold; 2]>,
    link_to: SmallVec<[Weak<ThreadEventInner>; 2]>,
    link_from: SmallVec<[Weak<ThreadEventInner>; 2]>,
}

struct ThreadEventInner {
    flag: AtomicBool,
    /// Teardown protocol counter; see the module docs.
    refs: AtomicUsize,
    os_waiters: AtomicUsize,
    os_condvar: Condvar,
    state: Mutex<TeState>,
}

impl ThreadEventInner {
    fn incref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn decref(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "thread event refs underflow");
        prev - 1
    }

    fn notify(&self) {
        self.incref();
        // Stop once only our own bump remains: no handle and no waiters
        // means there is nobody left to wake.
        self.fan_out(1);
        self.decref();
    }

    /// Wakes every registered waiter class: per-loop conditions under the
    /// state mutex, then the OS condvar. The holds walk stops early when
    /// `refs` falls to `stop_at` (a concurrent teardown drained the last
    /// interested party mid-iteration).
    fn fan_out(&self, stop_at: usize) {
        {
            let mut state = self.state.lock();
            let current = EventLoop::current();
            state.holds.retain(|hold| hold.event_loop.strong_count() > 0);
            for hold in &state.holds {
                if self.refs.load(Ordering::SeqCst) <= stop_at {
                    break;
                }
                let Some(lp) = hold.event_loop.upgrade() else {
                    continue;
                };
                if current.as_ref().is_some_and(|c| c.id() == hold.loop_id) {
                    hold.condition.notify_all();
                } else {
                    let condition = Arc::clone(&hold.condition);
                    EventLoop::from_inner(lp)
                        .call_later_thread_safe(Duration::ZERO, move || condition.notify_all());
                }
            }
        }
        if self.os_waiters.load(Ordering::SeqCst) > 0 {
            self.os_condvar.notify_all();
        }
    }
}

/// A sticky event that bridges coroutines across OS threads. Share it via
/// `Arc`; the single handle's `Drop` (or [`close`](Self::close)) runs the
/// teardown protocol.
pub struct ThreadEvent {
    inner: Arc<ThreadEventInner>,
    closed: AtomicBool,
}

impl ThreadEvent {
    /// Creates an unset event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ThreadEventInner {
                flag: AtomicBool::new(false),
                refs: AtomicUsize::new(1),
                os_waiters: AtomicUsize::new(0),
                os_condvar: Condvar::new(),
                state: Mutex::new(TeState {
                    holds: SmallVec::new(),
                    link_to: SmallVec::new(),
                    link_from: SmallVec::new(),
                }),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the flag and wakes every waiter on every thread. Idempotent on
    /// a set event.
    pub fn set(&self) {
        if self.inner.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify();
    }

    /// Resets the flag. Does not wake anyone.
    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::Release);
    }

    /// The current flag value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Blocks until the flag is set or the event is torn down. Returns the
    /// observed flag: `Ok(true)` after a `set`, `Ok(false)` after teardown.
    ///
    /// Coroutine callers park on their loop's hold; callers on threads
    /// with no event loop block on the OS condvar.
    pub fn wait(&self) -> Result<bool, AcquireError> {
        let inner = &self.inner;
        if inner.flag.load(Ordering::Acquire) {
            return Ok(true);
        }
        inner.incref();
        let result = match EventLoop::current() {
            None => Ok(wait_os(inner)),
            Some(event_loop) => wait_on_loop(inner, &event_loop),
        };
        inner.decref();
        result
    }

    /// Number of waiters across every thread.
    #[must_use]
    pub fn getting(&self) -> usize {
        self.inner.incref();
        let count = {
            let state = self.inner.state.lock();
            let held: usize = state.holds.iter().map(|h| h.condition.getting()).sum();
            held + self.inner.os_waiters.load(Ordering::SeqCst)
        };
        self.inner.decref();
        count
    }

    /// Records a symmetric link to `other`. Links are bookkeeping only;
    /// `set` does not propagate across them.
    pub fn link(&self, other: &ThreadEvent) {
        self.inner
            .state
            .lock()
            .link_to
            .push(Arc::downgrade(&other.inner));
        other
            .inner
            .state
            .lock()
            .link_from
            .push(Arc::downgrade(&self.inner));
    }

    /// Removes one link recorded by [`link`](Self::link).
    pub fn unlink(&self, other: &ThreadEvent) {
        remove_one(
            &mut self.inner.state.lock().link_to,
            &Arc::downgrade(&other.inner),
        );
        remove_one(
            &mut other.inner.state.lock().link_from,
            &Arc::downgrade(&self.inner),
        );
    }

    /// Runs the teardown protocol: drops the handle's `refs` contribution
    /// and, if waiters or in-flight operations remain, issues a final
    /// fan-out so they observe `refs == 1` and exit. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("thread event closing");
        if self.inner.decref() > 0 {
            // This fan-out carries no refs bump of its own, so a sole
            // parked waiter sits at refs == 1 and must still be visited;
            // only a fully drained event (refs == 0) stops the walk.
            self.inner.fan_out(0);
        }
    }
}

fn remove_one(
    list: &mut SmallVec<[Weak<ThreadEventInner>; 2]>,
    target: &Weak<ThreadEventInner>,
) {
    if let Some(pos) = list.iter().position(|w| w.ptr_eq(target)) {
        list.remove(pos);
    }
}

fn wait_os(inner: &ThreadEventInner) -> bool {
    let mut state = inner.state.lock();
    inner.os_waiters.fetch_add(1, Ordering::SeqCst);
    let mut flag = inner.flag.load(Ordering::Acquire);
    while !flag && inner.refs.load(Ordering::SeqCst) > 1 {
        inner.os_condvar.wait(&mut state);
        flag = inner.flag.load(Ordering::Acquire);
    }
    inner.os_waiters.fetch_sub(1, Ordering::SeqCst);
    flag
}

fn wait_on_loop(
    inner: &Arc<ThreadEventInner>,
    event_loop: &EventLoop,
) -> Result<bool, AcquireError> {
    let condition = {
        let mut state = inner.state.lock();
        match state.holds.iter().find(|h| h.loop_id == event_loop.id()) {
            Some(hold) => Arc::clone(&hold.condition),
            None => {
                let condition = Arc::new(Condition::new());
                state.holds.push(Hold {
                    loop_id: event_loop.id(),
                    event_loop: event_loop.inner_weak(),
                    condition: Arc::clone(&condition),
                });
                condition
            }
        }
    };
    let mut flag = inner.flag.load(Ordering::Acquire);
    while !flag && inner.refs.load(Ordering::SeqCst) > 1 {
        match condition.wait() {
            Ok(()) => {}
            Err(AcquireError::Cancelled) => return Err(AcquireError::Cancelled),
            // The hold was torn down under us; report the flag we saw.
            Err(_) => break,
        }
        flag = inner.flag.load(Ordering::Acquire);
    }
    Ok(flag)
}

impl Default for ThreadEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadEvent {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ThreadEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadEvent")
            .field("set", &self.is_set())
            .field("refs", &self.inner.refs.load(Ordering::SeqCst))
            .finish()
    }
}
