//! Cooperative coroutines with stable identity and synchronous handoff.
//!
//! Every coroutine runs on a dedicated carrier thread, but only one
//! context (the event loop or a single coroutine) is ever runnable at a
//! time: control moves through one-slot [`Mailbox`] batons, so the whole
//! runtime keeps the run-to-completion discipline of a single-threaded
//! scheduler. A parked coroutine is resumed by posting a [`WakeReason`]
//! into its mailbox; the resumer then blocks until the coroutine yields
//! back or finishes.
//!
//! # Cancellation
//!
//! Cancellation is not an unwinding exception: [`Coroutine::cancel`]
//! resumes a parked coroutine with [`WakeReason::Cancelled`], and every
//! suspending operation is responsible for removing its waiter bookkeeping
//! before surfacing an error to the caller.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::runtime::event_loop::{EventLoop, LoopInner};
use crate::sync::{AcquireError, Event};
use crate::tracing_compat::{debug, error, trace, warn};

/// Why a parked coroutine was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken by the wake path of the primitive it parked on (or handed
    /// the scheduler baton).
    Resumed,
    /// A cancellation was delivered at the suspension point.
    Cancelled,
    /// The event loop is shutting down.
    Shutdown,
}

/// Stable identity of a coroutine. Nonzero for live coroutines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(u64);

impl CoroutineId {
    /// The raw integer identity.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// One-slot baton for control transfer between contexts.
///
/// `post` never blocks; `receive` blocks until a value arrives. The slot
/// holds at most one pending reason, which is enough because a context is
/// resumed at most once per suspension.
pub(crate) struct Mailbox {
    slot: Mutex<Option<WakeReason>>,
    available: Condvar,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            available: Condvar::new(),
        }
    }

    pub(crate) fn post(&self, reason: WakeReason) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "baton posted twice without a receive");
        *slot = Some(reason);
        self.available.notify_one();
    }

    pub(crate) fn receive(&self) -> WakeReason {
        let mut slot = self.slot.lock();
        loop {
            if let Some(reason) = slot.take() {
                return reason;
            }
            self.available.wait(&mut slot);
        }
    }
}

pub(crate) struct CoroutineInner {
    id: CoroutineId,
    mailbox: Arc<Mailbox>,
    /// Context to hand control back to on the next yield or on completion.
    return_to: Mutex<Option<Arc<Mailbox>>>,
    parked: AtomicBool,
    finished: AtomicBool,
    done: Event,
    event_loop: Weak<LoopInner>,
}

/// Handle to a cooperative coroutine.
#[derive(Clone)]
pub struct Coroutine {
    inner: Arc<CoroutineInner>,
}

/// Weak handle that observes coroutine liveness without keeping the
/// coroutine alive. Waiter queues hold these so a coroutine dropped while
/// parked can be skipped during wake-up.
#[derive(Clone)]
pub struct WeakCoroutine {
    id: CoroutineId,
    inner: Weak<CoroutineInner>,
}

pub(crate) enum RuntimeContext {
    Loop(Arc<LoopInner>),
    Coroutine(Arc<CoroutineInner>),
}

thread_local! {
    static CONTEXT: RefCell<Option<RuntimeContext>> = const { RefCell::new(None) };
}

pub(crate) fn set_context(context: RuntimeContext) {
    CONTEXT.with(|cell| {
        let mut cell = cell.borrow_mut();
        debug_assert!(cell.is_none(), "runtime context already set on this thread");
        *cell = Some(context);
    });
}

pub(crate) fn clear_context() {
    CONTEXT.with(|cell| {
        cell.borrow_mut().take();
    });
}

/// The event loop reachable from the calling thread, if any.
pub(crate) fn current_loop_inner() -> Option<Arc<LoopInner>> {
    CONTEXT.with(|cell| match cell.borrow().as_ref() {
        Some(RuntimeContext::Loop(lp)) => Some(Arc::clone(lp)),
        Some(RuntimeContext::Coroutine(co)) => co.event_loop.upgrade(),
        None => None,
    })
}

fn current_coroutine_inner() -> Option<Arc<CoroutineInner>> {
    CONTEXT.with(|cell| match cell.borrow().as_ref() {
        Some(RuntimeContext::Coroutine(co)) => Some(Arc::clone(co)),
        _ => None,
    })
}

fn current_mailbox() -> Option<Arc<Mailbox>> {
    CONTEXT.with(|cell| match cell.borrow().as_ref() {
        Some(RuntimeContext::Loop(lp)) => Some(lp.mailbox()),
        Some(RuntimeContext::Coroutine(co)) => Some(Arc::clone(&co.mailbox)),
        None => None,
    })
}

/// Suspends the current coroutine and hands control back to whichever
/// context resumed it. Returns the reason for the eventual wake-up.
///
/// # Panics
///
/// Panics when called from the event-loop context or from a thread with no
/// runtime context at all: the loop must never park, and there is nothing
/// to suspend outside a coroutine.
pub fn yield_now() -> WakeReason {
    let inner = current_coroutine_inner()
        .expect("yield_now outside a coroutine; the event-loop context must never park");
    let return_to = inner
        .return_to
        .lock()
        .take()
        .expect("suspending coroutine has no context to yield to");
    inner.parked.store(true, Ordering::Release);
    return_to.post(WakeReason::Resumed);
    inner.mailbox.receive()
}

pub(crate) fn spawn_on(
    loop_inner: &Arc<LoopInner>,
    f: impl FnOnce() + Send + 'static,
) -> Coroutine {
    let id = CoroutineId(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed));
    let inner = Arc::new(CoroutineInner {
        id,
        mailbox: Arc::new(Mailbox::new()),
        return_to: Mutex::new(None),
        parked: AtomicBool::new(true),
        finished: AtomicBool::new(false),
        done: Event::new(),
        event_loop: Arc::downgrade(loop_inner),
    });
    let coroutine = Coroutine {
        inner: Arc::clone(&inner),
    };
    loop_inner.register_coroutine(&coroutine);

    std::thread::Builder::new()
        .name(format!("{}-{}", loop_inner.name(), id))
        .spawn(move || carrier_main(inner, f))
        .expect("failed to spawn coroutine carrier thread");

    let start = coroutine.clone();
    loop_inner.call_later(Duration::ZERO, move || start.resume(WakeReason::Resumed));
    trace!(coroutine = %id, "spawned");
    coroutine
}

fn carrier_main(inner: Arc<CoroutineInner>, f: impl FnOnce() + Send + 'static) {
    let id = inner.id;
    set_context(RuntimeContext::Coroutine(Arc::clone(&inner)));
    let reason = inner.mailbox.receive();
    if reason == WakeReason::Resumed {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(coroutine = %id, "coroutine body panicked");
        }
    } else {
        debug!(coroutine = %id, ?reason, "coroutine torn down before its body ran");
    }
    // Signal completion while the coroutine context is still current, so
    // waiters parked in join() are scheduled on this loop.
    inner.done.set();
    inner.finished.store(true, Ordering::Release);
    if let Some(lp) = inner.event_loop.upgrade() {
        lp.coroutine_finished(id);
    }
    clear_context();
    let return_to = inner.return_to.lock().take();
    if let Some(return_to) = return_to {
        return_to.post(WakeReason::Resumed);
    }
    trace!(coroutine = %id, "finished");
}

impl Coroutine {
    /// The coroutine executing on the calling thread, if any.
    #[must_use]
    pub fn current() -> Option<Coroutine> {
        current_coroutine_inner().map(|inner| Coroutine { inner })
    }

    /// Stable identity of this coroutine.
    #[must_use]
    pub fn id(&self) -> CoroutineId {
        self.inner.id
    }

    /// True once the coroutine body has returned (or was torn down).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.inner.parked.load(Ordering::Acquire)
    }

    /// A weak handle observing this coroutine's liveness.
    #[must_use]
    pub fn downgrade(&self) -> WeakCoroutine {
        WeakCoroutine {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The event loop this coroutine belongs to, if it is still alive.
    #[must_use]
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.inner.event_loop.upgrade().map(EventLoop::from_inner)
    }

    /// Blocks the calling coroutine until this coroutine finishes.
    ///
    /// Only valid between coroutines of the same event loop. Joining the
    /// current coroutine is a no-op (with a warning).
    pub fn join(&self) -> Result<(), AcquireError> {
        if let Some(current) = Coroutine::current() {
            if current.id() == self.id() {
                warn!(coroutine = %self.id(), "join on the current coroutine; ignored");
                return Ok(());
            }
        }
        if self.is_finished() {
            return Ok(());
        }
        self.inner.done.wait()
    }

    /// Delivers a cancellation to this coroutine's suspension point.
    ///
    /// The target is resumed with [`WakeReason::Cancelled`]; the suspended
    /// operation cleans up its waiter bookkeeping and surfaces
    /// [`AcquireError::Cancelled`] to the coroutine body. Cancelling a
    /// finished coroutine is a no-op; cancelling one that is not parked is
    /// ignored with a warning.
    pub fn cancel(&self) {
        if self.is_finished() {
            return;
        }
        if !self.is_parked() {
            warn!(coroutine = %self.id(), "cancel on a coroutine that is not parked; ignored");
            return;
        }
        debug!(coroutine = %self.id(), "delivering cancellation");
        self.resume(WakeReason::Cancelled);
    }

    /// Resumes a parked coroutine with the given reason and blocks until it
    /// yields back or finishes.
    pub(crate) fn resume(&self, reason: WakeReason) {
        if self.is_finished() {
            return;
        }
        let home = current_mailbox().expect("resume requires a runtime context");
        *self.inner.return_to.lock() = Some(Arc::clone(&home));
        self.inner.parked.store(false, Ordering::Release);
        self.inner.mailbox.post(reason);
        let _ = home.receive();
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.inner.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl WeakCoroutine {
    /// Identity of the coroutine this handle was taken from.
    #[must_use]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    /// Upgrades to a strong handle if the coroutine is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Coroutine> {
        self.inner.upgrade().map(|inner| Coroutine { inner })
    }
}

impl std::fmt::Debug for WeakCoroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakCoroutine")
            .field("id", &self.id)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
