//! The per-thread event loop: deferred callbacks and the run loop.
//!
//! Callbacks are kept in a min-heap ordered by deadline (with a sequence
//! tiebreak so same-deadline callbacks fire in submission order).
//! [`EventLoop::run`] drains due callbacks one at a time; when a callback
//! resumes a coroutine, the loop thread blocks until that coroutine yields
//! back, so there is never more than one runnable context.
//!
//! `call_later` / `cancel_call` / `call_later_thread_safe` are the only
//! scheduling surface the synchronization primitives use.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, LoopConfig};
use crate::runtime::coroutine::{
    self, Coroutine, CoroutineId, Mailbox, RuntimeContext, WakeReason, WeakCoroutine,
};
use crate::tracing_compat::{debug, trace};

/// Identity of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    /// The raw integer identity.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Handle for cancelling a deferred callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    due: Instant,
    seq: u64,
    id: u64,
    callback: Callback,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for a min-heap (earliest deadline first).
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<Scheduled>,
    /// Ids cancelled while still queued; entries are dropped when they
    /// reach the head.
    cancelled: HashSet<u64>,
    next_callback: u64,
    next_seq: u64,
}

pub(crate) struct LoopInner {
    id: LoopId,
    name: String,
    idle_park: Duration,
    mailbox: Arc<Mailbox>,
    queue: Mutex<QueueState>,
    wakeup: Condvar,
    running: AtomicBool,
    /// Spawned coroutines that have not finished yet.
    live: AtomicUsize,
    coroutines: Mutex<Vec<WeakCoroutine>>,
}

impl LoopInner {
    pub(crate) fn id(&self) -> LoopId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    pub(crate) fn call_later(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> CallbackId {
        let id = {
            let mut queue = self.queue.lock();
            let id = queue.next_callback;
            queue.next_callback += 1;
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(Scheduled {
                due: Instant::now() + delay,
                seq,
                id,
                callback: Box::new(f),
            });
            id
        };
        self.wakeup.notify_one();
        trace!(event_loop = %self.id, callback = id, ?delay, "scheduled callback");
        CallbackId(id)
    }

    pub(crate) fn cancel_call(&self, id: CallbackId) {
        let mut queue = self.queue.lock();
        let queued = queue.heap.iter().any(|s| s.id == id.0);
        if queued {
            queue.cancelled.insert(id.0);
            trace!(event_loop = %self.id, callback = id.0, "cancelled callback");
        }
    }

    pub(crate) fn register_coroutine(&self, coroutine: &Coroutine) {
        self.live.fetch_add(1, Ordering::AcqRel);
        let mut list = self.coroutines.lock();
        list.retain(|weak| weak.upgrade().is_some_and(|c| !c.is_finished()));
        list.push(coroutine.downgrade());
    }

    pub(crate) fn coroutine_finished(&self, id: CoroutineId) {
        let remaining = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(event_loop = %self.id, coroutine = %id, remaining, "coroutine finished");
        self.wakeup.notify_one();
    }
}

/// Handle to an event loop. Cheap to clone; safe to share across threads
/// (only `call_later_thread_safe` is meant to be used from foreign
/// threads).
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop with the default [`LoopConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default()).expect("default loop config is valid")
    }

    /// Creates a loop with the given configuration.
    pub fn with_config(config: LoopConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let id = LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed));
        Ok(Self {
            inner: Arc::new(LoopInner {
                id,
                name: config.name,
                idle_park: config.idle_park,
                mailbox: Arc::new(Mailbox::new()),
                queue: Mutex::new(QueueState {
                    heap: BinaryHeap::with_capacity(config.callback_capacity),
                    cancelled: HashSet::new(),
                    next_callback: 1,
                    next_seq: 0,
                }),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
                live: AtomicUsize::new(0),
                coroutines: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The event loop reachable from the calling thread: the loop itself
    /// when called from loop context, the owning loop when called from a
    /// coroutine, `None` elsewhere.
    #[must_use]
    pub fn current() -> Option<EventLoop> {
        coroutine::current_loop_inner().map(|inner| EventLoop { inner })
    }

    pub(crate) fn from_inner(inner: Arc<LoopInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner_weak(&self) -> std::sync::Weak<LoopInner> {
        Arc::downgrade(&self.inner)
    }

    /// This loop's identity.
    #[must_use]
    pub fn id(&self) -> LoopId {
        self.inner.id
    }

    /// This loop's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawns a coroutine on this loop. Its body starts running once
    /// [`run`](Self::run) processes the start callback.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) -> Coroutine {
        coroutine::spawn_on(&self.inner, f)
    }

    /// Schedules `f` to run on this loop after `delay`. Returns an id that
    /// can be passed to [`cancel_call`](Self::cancel_call).
    pub fn call_later(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> CallbackId {
        self.inner.call_later(delay, f)
    }

    /// Cancels a scheduled callback. Idempotent; a no-op if the callback
    /// already fired.
    pub fn cancel_call(&self, id: CallbackId) {
        self.inner.cancel_call(id);
    }

    /// Schedules `f` from any thread. The loop is woken if it is parked.
    pub fn call_later_thread_safe(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let _ = self.inner.call_later(delay, f);
    }

    /// Number of callbacks currently queued (cancelled ones excluded).
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        let queue = self.inner.queue.lock();
        queue.heap.len() - queue.cancelled.len()
    }

    /// Number of spawned coroutines that have not finished.
    #[must_use]
    pub fn alive_coroutines(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Runs the loop on the calling thread until every due callback has
    /// fired and every spawned coroutine has finished.
    ///
    /// # Panics
    ///
    /// Panics if the loop is already running or if the calling thread
    /// already hosts a runtime context.
    pub fn run(&self) {
        assert!(
            !self.inner.running.swap(true, Ordering::AcqRel),
            "event loop is already running"
        );
        coroutine::set_context(RuntimeContext::Loop(Arc::clone(&self.inner)));
        debug!(event_loop = %self.inner.id, "run starting");

        enum Step {
            Run(Callback),
            WaitUntil(Instant),
            Park,
            Exit,
        }

        loop {
            let next = {
                let mut queue = self.inner.queue.lock();
                loop {
                    let step = {
                        let state = &mut *queue;
                        // Drop cancelled entries that reached the head.
                        loop {
                            let head_cancelled = match state.heap.peek() {
                                Some(top) => state.cancelled.contains(&top.id),
                                None => false,
                            };
                            if !head_cancelled {
                                break;
                            }
                            if let Some(dropped) = state.heap.pop() {
                                state.cancelled.remove(&dropped.id);
                                trace!(callback = dropped.id, "dropped cancelled callback");
                            }
                        }
                        let now = Instant::now();
                        let head_due = state.heap.peek().map(|top| top.due);
                        match head_due {
                            Some(due) if due <= now => {
                                let scheduled =
                                    state.heap.pop().expect("peeked callback disappeared");
                                Step::Run(scheduled.callback)
                            }
                            Some(due) => Step::WaitUntil(due),
                            None if self.inner.live.load(Ordering::Acquire) == 0 => Step::Exit,
                            None => Step::Park,
                        }
                    };
                    match step {
                        Step::Run(callback) => break Some(callback),
                        Step::Exit => break None,
                        Step::WaitUntil(due) => {
                            let _ = self.inner.wakeup.wait_until(&mut queue, due);
                        }
                        Step::Park => {
                            let _ = self.inner.wakeup.wait_for(&mut queue, self.inner.idle_park);
                        }
                    }
                }
            };
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }

        coroutine::clear_context();
        self.inner.running.store(false, Ordering::Release);
        debug!(event_loop = %self.inner.id, "run finished");
    }

    /// Requests shutdown: every coroutine still parked when the request is
    /// processed is resumed with [`WakeReason::Shutdown`]. Safe to call
    /// from any thread.
    pub fn shutdown(&self) {
        debug!(event_loop = %self.inner.id, "shutdown requested");
        let inner = Arc::clone(&self.inner);
        self.call_later_thread_safe(Duration::ZERO, move || {
            let parked: Vec<Coroutine> = {
                let list = inner.coroutines.lock();
                list.iter()
                    .filter_map(WeakCoroutine::upgrade)
                    .filter(|c| !c.is_finished() && c.is_parked())
                    .collect()
            };
            for coroutine in parked {
                trace!(coroutine = %coroutine.id(), "shutting down parked coroutine");
                coroutine.resume(WakeReason::Shutdown);
            }
        });
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for EventLoop {}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{AcquireError, Event, Semaphore};
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex as PlainMutex;
    use std::thread;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn recorder() -> Arc<PlainMutex<Vec<String>>> {
        Arc::new(PlainMutex::new(Vec::new()))
    }

    #[test]
    fn run_returns_immediately_when_idle() {
        init_test("run_returns_immediately_when_idle");
        let event_loop = EventLoop::new();
        event_loop.run();
        crate::assert_with_log!(
            event_loop.pending_callbacks() == 0,
            "nothing queued",
            0usize,
            event_loop.pending_callbacks()
        );
        crate::test_complete!("run_returns_immediately_when_idle");
    }

    #[test]
    fn same_delay_callbacks_fire_in_submission_order() {
        init_test("same_delay_callbacks_fire_in_submission_order");
        let event_loop = EventLoop::new();
        let log = recorder();
        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            event_loop.call_later(Duration::ZERO, move || log.lock().push(name.to_string()));
        }
        event_loop.run();
        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["first", "second", "third"],
            "submission order kept",
            vec!["first", "second", "third"],
            entries
        );
        crate::test_complete!("same_delay_callbacks_fire_in_submission_order");
    }

    #[test]
    fn delayed_callbacks_fire_after_immediate_ones() {
        init_test("delayed_callbacks_fire_after_immediate_ones");
        let event_loop = EventLoop::new();
        let log = recorder();
        {
            let log = Arc::clone(&log);
            event_loop.call_later(Duration::from_millis(30), move || {
                log.lock().push("delayed".to_string());
            });
        }
        {
            let log = Arc::clone(&log);
            event_loop.call_later(Duration::ZERO, move || {
                log.lock().push("immediate".to_string());
            });
        }
        event_loop.run();
        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["immediate", "delayed"],
            "deadline order respected",
            vec!["immediate", "delayed"],
            entries
        );
        crate::test_complete!("delayed_callbacks_fire_after_immediate_ones");
    }

    #[test]
    fn cancel_call_is_idempotent_and_safe_after_fire() {
        init_test("cancel_call_is_idempotent_and_safe_after_fire");
        let event_loop = EventLoop::new();
        let log = recorder();
        let cancelled = {
            let log = Arc::clone(&log);
            event_loop.call_later(Duration::ZERO, move || log.lock().push("cancelled".to_string()))
        };
        let kept = {
            let log = Arc::clone(&log);
            event_loop.call_later(Duration::ZERO, move || log.lock().push("kept".to_string()))
        };
        event_loop.cancel_call(cancelled);
        event_loop.cancel_call(cancelled);
        event_loop.run();
        event_loop.cancel_call(kept); // already fired; must be a no-op

        let entries = log.lock().clone();
        crate::assert_with_log!(entries == ["kept"], "only the kept callback ran", vec!["kept"], entries);
        crate::assert_with_log!(
            event_loop.pending_callbacks() == 0,
            "queue drained",
            0usize,
            event_loop.pending_callbacks()
        );
        crate::test_complete!("cancel_call_is_idempotent_and_safe_after_fire");
    }

    #[test]
    fn thread_safe_post_wakes_a_parked_loop() {
        init_test("thread_safe_post_wakes_a_parked_loop");
        let event_loop = EventLoop::new();
        let release = Arc::new(Event::new());
        let log = recorder();
        {
            let release = Arc::clone(&release);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let result = release.wait();
                log.lock().push(format!("woken:{}", result.is_ok()));
            });
        }
        let poster = {
            let event_loop = event_loop.clone();
            let release = Arc::clone(&release);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                event_loop
                    .call_later_thread_safe(Duration::ZERO, move || release.set());
            })
        };
        event_loop.run();
        poster.join().expect("poster thread panicked");

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["woken:true"],
            "coroutine woken by cross-thread post",
            vec!["woken:true"],
            entries
        );
        crate::test_complete!("thread_safe_post_wakes_a_parked_loop");
    }

    #[test]
    fn shutdown_fails_parked_coroutines() {
        init_test("shutdown_fails_parked_coroutines");
        let event_loop = EventLoop::new();
        let semaphore = Arc::new(Semaphore::new(0));
        let log = recorder();
        {
            let semaphore = Arc::clone(&semaphore);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let result = semaphore.acquire();
                log.lock()
                    .push(format!("waiter:{}", result == Err(AcquireError::Closed)));
            });
        }
        {
            let event_loop = event_loop.clone();
            event_loop
                .clone()
                .call_later(Duration::ZERO, move || event_loop.shutdown());
        }
        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["waiter:true"],
            "parked coroutine observed shutdown",
            vec!["waiter:true"],
            entries
        );
        crate::assert_with_log!(
            semaphore.getting() == 0,
            "waiter withdrew from the queue",
            0usize,
            semaphore.getting()
        );
        crate::test_complete!("shutdown_fails_parked_coroutines");
    }

    #[test]
    fn loops_have_distinct_ids_and_names() {
        init_test("loops_have_distinct_ids_and_names");
        let first = EventLoop::new();
        let second =
            EventLoop::with_config(crate::config::LoopConfig::named("aux-loop")).expect("config");
        crate::assert_with_log!(first.id() != second.id(), "distinct ids", true, first.id() != second.id());
        crate::assert_with_log!(second.name() == "aux-loop", "name kept", "aux-loop", second.name());
        crate::test_complete!("loops_have_distinct_ids_and_names");
    }
}
