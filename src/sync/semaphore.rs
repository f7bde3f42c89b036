//! Counting semaphore with FIFO handoff through the event loop.
//!
//! Contended acquirers park on a waiter queue (weak coroutine handles, so
//! a coroutine dropped while parked is skipped) and are woken by a single
//! deferred callback scheduled on the loop. That callback walks the queue
//! in order, granting one token per waiter and resuming each directly:
//! FIFO with no re-contention and no thundering herd.
//!
//! # Cancel safety
//!
//! Cancellation delivered at the suspension point removes the waiter from
//! the queue before [`AcquireError::Cancelled`] is returned; no token is
//! consumed and the semaphore is left as if the call had never been made.
//!
//! # Teardown
//!
//! [`Semaphore::close`] cancels any pending wake and schedules a drain
//! that resumes every parked waiter without granting tokens; those callers
//! observe [`AcquireError::Closed`]. The drain callback owns the shared
//! state, so teardown completes even after the handle is dropped.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::{
    yield_now, CallbackId, Coroutine, CoroutineId, EventLoop, WakeReason, WeakCoroutine,
};
use crate::tracing_compat::debug;

/// Error returned when a blocking acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The primitive was closed (or its loop shut down) while waiting.
    Closed,
    /// Cancelled while parked.
    Cancelled,
    /// More tokens were requested than the semaphore was created with.
    ExceedsCapacity,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "primitive closed"),
            Self::Cancelled => write!(f, "acquire cancelled"),
            Self::ExceedsCapacity => write!(f, "requested more tokens than the initial value"),
        }
    }
}

impl std::error::Error for AcquireError {}

struct SemaphoreState {
    counter: u32,
    waiters: VecDeque<WeakCoroutine>,
    /// Id of the scheduled wake callback, when one is outstanding. Doubles
    /// as the "wake in progress" marker a resumed waiter checks to tell a
    /// granted token from a teardown drain.
    pending_wake: Option<CallbackId>,
    closed: bool,
}

pub(crate) struct SemaphoreShared {
    init_value: u32,
    state: Mutex<SemaphoreState>,
}

/// A counting semaphore for coroutines of one event loop.
pub struct Semaphore {
    shared: Arc<SemaphoreShared>,
}

impl Semaphore {
    /// Creates a semaphore holding `value` tokens. `value` is also the
    /// ceiling the counter is clamped to on release.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Self {
            shared: Arc::new(SemaphoreShared {
                init_value: value,
                state: Mutex::new(SemaphoreState {
                    counter: value,
                    waiters: VecDeque::with_capacity(4),
                    pending_wake: None,
                    closed: false,
                }),
            }),
        }
    }

    /// The number of tokens the semaphore was created with.
    #[must_use]
    pub fn init_value(&self) -> u32 {
        self.shared.init_value
    }

    /// Acquires one token, parking the calling coroutine if none is
    /// available.
    ///
    /// # Panics
    ///
    /// Panics when a contended acquire is attempted outside a coroutine
    /// (in particular from the event-loop context, which must never park).
    pub fn acquire(&self) -> Result<(), AcquireError> {
        acquire_shared(&self.shared)
    }

    /// Takes one token without parking. Returns false when none is
    /// available or the semaphore is closed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed || state.counter == 0 {
            return false;
        }
        state.counter -= 1;
        true
    }

    /// Acquires `n` tokens one at a time.
    ///
    /// Fails with [`AcquireError::ExceedsCapacity`] when `n` is larger
    /// than the initial value. On any later failure, tokens already taken
    /// are **not** rolled back; the caller owns whatever was acquired.
    pub fn acquire_many(&self, n: u32) -> Result<(), AcquireError> {
        if n > self.shared.init_value {
            return Err(AcquireError::ExceedsCapacity);
        }
        for _ in 0..n {
            self.acquire()?;
        }
        Ok(())
    }

    /// Non-blocking form of [`acquire_many`](Self::acquire_many), with the
    /// same non-rollback semantics.
    pub fn try_acquire_many(&self, n: u32) -> bool {
        if n > self.shared.init_value {
            return false;
        }
        for _ in 0..n {
            if !self.try_acquire() {
                return false;
            }
        }
        true
    }

    /// Returns one token.
    pub fn release(&self) {
        release_shared(&self.shared, 1);
    }

    /// Returns `n` tokens. A zero `n` is a no-op; the counter saturates at
    /// the initial value.
    pub fn release_n(&self, n: u32) {
        release_shared(&self.shared, n);
    }

    /// True when no token is currently available.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.shared.state.lock().counter == 0
    }

    /// True when at least one token is out.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.shared.state.lock().counter < self.shared.init_value
    }

    /// Number of coroutines parked on this semaphore.
    #[must_use]
    pub fn getting(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// Closes the semaphore: cancels any outstanding wake, fails future
    /// acquisitions fast, and drains parked waiters with
    /// [`AcquireError::Closed`]. Idempotent.
    pub fn close(&self) {
        close_shared(&self.shared);
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        close_shared(&self.shared);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Semaphore")
            .field("init_value", &self.shared.init_value)
            .field("counter", &state.counter)
            .field("waiters", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

fn contains_waiter(waiters: &VecDeque<WeakCoroutine>, id: CoroutineId) -> bool {
    waiters.iter().any(|w| w.id() == id)
}

fn remove_waiter(shared: &SemaphoreShared, id: CoroutineId) -> bool {
    let mut state = shared.state.lock();
    let before = state.waiters.len();
    state.waiters.retain(|w| w.id() != id);
    state.waiters.len() != before
}

fn acquire_shared(shared: &Arc<SemaphoreShared>) -> Result<(), AcquireError> {
    let current = {
        let mut state = shared.state.lock();
        if state.closed {
            return Err(AcquireError::Closed);
        }
        if state.counter > 0 {
            state.counter -= 1;
            return Ok(());
        }
        let current = Coroutine::current()
            .expect("contended Semaphore::acquire outside a coroutine; the event-loop context must never park");
        state.waiters.push_back(current.downgrade());
        current
    };
    match yield_now() {
        WakeReason::Resumed => {
            let state = shared.state.lock();
            // The wake path removed us before resuming; still being queued
            // means the resume came from somewhere it never should.
            debug_assert!(
                !contains_waiter(&state.waiters, current.id()),
                "resumed semaphore waiter is still queued"
            );
            if state.pending_wake.is_some() {
                Ok(())
            } else {
                Err(AcquireError::Closed)
            }
        }
        WakeReason::Cancelled => {
            let removed = remove_waiter(shared, current.id());
            debug_assert!(removed, "cancelled semaphore waiter was not queued");
            Err(AcquireError::Cancelled)
        }
        WakeReason::Shutdown => {
            remove_waiter(shared, current.id());
            Err(AcquireError::Closed)
        }
    }
}

fn release_shared(shared: &Arc<SemaphoreShared>, n: u32) {
    if n == 0 {
        return;
    }
    let mut state = shared.state.lock();
    if state.closed {
        return;
    }
    state.counter = state.counter.saturating_add(n).min(shared.init_value);
    if state.pending_wake.is_none() && !state.waiters.is_empty() {
        let event_loop = EventLoop::current()
            .expect("Semaphore::release with parked waiters requires a current event loop");
        let wake = Arc::clone(shared);
        let id = event_loop.call_later(Duration::ZERO, move || notify_waiters(&wake, false));
        state.pending_wake = Some(id);
    }
}

/// The wake/drain callback. `drain` is set on the teardown path: every
/// waiter is resumed without consuming tokens, and observes no wake in
/// progress.
fn notify_waiters(shared: &Arc<SemaphoreShared>, drain: bool) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            let wake_active = drain || state.pending_wake.is_some();
            let tokens_left = drain || state.counter > 0;
            if !wake_active || !tokens_left || state.waiters.is_empty() {
                None
            } else {
                match state.waiters.pop_front() {
                    None => None,
                    Some(waiter) => match waiter.upgrade() {
                        Some(coroutine) => {
                            if !drain {
                                state.counter -= 1;
                            }
                            Some(Some(coroutine))
                        }
                        None => Some(None),
                    },
                }
            }
        };
        match next {
            None => break,
            Some(None) => {
                debug!("skipping semaphore waiter whose coroutine was dropped while parked");
            }
            Some(Some(coroutine)) => coroutine.resume(WakeReason::Resumed),
        }
    }
    // Cleared only after the last waiter ran: resumed waiters read
    // pending_wake to tell a granted token from a teardown drain.
    shared.state.lock().pending_wake = None;
}

fn close_shared(shared: &Arc<SemaphoreShared>) {
    let (pending, has_waiters) = {
        let mut state = shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let pending = state.pending_wake.take();
        state.counter = state.counter.saturating_add(state.waiters.len() as u32);
        (pending, !state.waiters.is_empty())
    };
    if pending.is_none() && !has_waiters {
        return;
    }
    let event_loop = EventLoop::current()
        .expect("Semaphore::close with parked waiters requires a current event loop");
    if let Some(id) = pending {
        event_loop.cancel_call(id);
    }
    if has_waiters {
        let drain = Arc::clone(shared);
        event_loop.call_later(Duration::ZERO, move || notify_waiters(&drain, true));
    }
}

/// Takes `n` tokens from the first semaphore in `semaphores` that has that
/// many available, without parking.
pub fn try_acquire_any(semaphores: &[Arc<Semaphore>], n: u32) -> Option<Arc<Semaphore>> {
    for sem in semaphores {
        let mut state = sem.shared.state.lock();
        if !state.closed && state.counter >= n {
            state.counter -= n;
            return Some(Arc::clone(sem));
        }
    }
    None
}

/// Acquires `n` tokens from whichever semaphore can grant first.
///
/// Fast path: scan for a semaphore with `n` tokens available. Otherwise
/// the calling coroutine parks on every queue; the first semaphore whose
/// wake path reaches it grants one token, the caller withdraws from the
/// other queues and takes the remaining `n − 1` tokens from the grantor
/// (with [`acquire_many`](Semaphore::acquire_many)'s non-rollback
/// semantics). Cancellation and teardown withdraw the caller from every
/// queue before the error is surfaced.
pub fn acquire_any(
    semaphores: &[Arc<Semaphore>],
    n: u32,
) -> Result<Arc<Semaphore>, AcquireError> {
    if let Some(sem) = try_acquire_any(semaphores, n) {
        return Ok(sem);
    }
    if semaphores.is_empty() {
        return Err(AcquireError::Closed);
    }
    let current = Coroutine::current()
        .expect("blocking acquire_any outside a coroutine; the event-loop context must never park");
    for sem in semaphores {
        sem.shared
            .state
            .lock()
            .waiters
            .push_back(current.downgrade());
    }
    let withdraw = || {
        for sem in semaphores {
            remove_waiter(&sem.shared, current.id());
        }
    };
    match yield_now() {
        WakeReason::Resumed => {
            // Exactly one wake path popped us and granted a token; it is
            // mid-drain, so its pending_wake is still set.
            let mut granted = None;
            for sem in semaphores {
                let state = sem.shared.state.lock();
                if granted.is_none()
                    && state.pending_wake.is_some()
                    && !contains_waiter(&state.waiters, current.id())
                {
                    granted = Some(Arc::clone(sem));
                }
            }
            withdraw();
            match granted {
                Some(sem) => {
                    if n > 1 {
                        sem.acquire_many(n - 1)?;
                    }
                    Ok(sem)
                }
                None => Err(AcquireError::Closed),
            }
        }
        WakeReason::Cancelled => {
            withdraw();
            Err(AcquireError::Cancelled)
        }
        WakeReason::Shutdown => {
            withdraw();
            Err(AcquireError::Closed)
        }
    }
}

/// A binary semaphore.
///
/// `release` from a non-holder is permitted at the API level; ownership
/// discipline is the caller's responsibility (use [`RLock`] for owner
/// tracking).
///
/// [`RLock`]: crate::sync::RLock
pub struct Lock {
    sem: Semaphore,
}

impl Lock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
        }
    }

    /// Acquires the lock, parking the calling coroutine while it is held.
    pub fn acquire(&self) -> Result<(), AcquireError> {
        self.sem.acquire()
    }

    /// Takes the lock without parking.
    pub fn try_acquire(&self) -> bool {
        self.sem.try_acquire()
    }

    /// Releases the lock.
    pub fn release(&self) {
        self.sem.release();
    }

    /// Acquires and returns a guard that releases on drop.
    pub fn lock(&self) -> Result<LockGuard<'_>, AcquireError> {
        self.acquire()?;
        Ok(LockGuard { lock: self })
    }

    /// Non-blocking form of [`lock`](Self::lock).
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        if self.try_acquire() {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }

    /// True while the lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.sem.is_locked()
    }

    /// Number of coroutines parked on this lock.
    #[must_use]
    pub fn getting(&self) -> usize {
        self.sem.getting()
    }

    /// Closes the lock; parked waiters observe [`AcquireError::Closed`].
    pub fn close(&self) {
        self.sem.close();
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("locked", &self.is_locked())
            .field("waiters", &self.getting())
            .finish()
    }
}

/// Releases the owning [`Lock`] on drop.
#[must_use = "the lock is released immediately if the guard is not held"]
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
