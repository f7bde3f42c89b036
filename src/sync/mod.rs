//! Coroutine-aware synchronization primitives.
//!
//! All primitives except [`ThreadEvent`] belong to a single event loop:
//! their state is touched only from that loop's thread, one coroutine at
//! a time, and the interior locks exist to satisfy `Send`/`Sync` rather
//! than to arbitrate real contention. [`ThreadEvent`] is the bridge
//! across OS threads.
//!
//! # Primitives
//!
//! - [`Semaphore`] / [`Lock`]: counting/binary gate with FIFO handoff
//! - [`RLock`]: re-entrant lock with owner tracking
//! - [`Condition`]: wait/notify over private per-waiter locks
//! - [`Event`] / [`ValueEvent`]: sticky flag with propagation links
//! - [`ThreadEvent`]: cross-thread sticky flag with per-loop fan-out
//! - [`Gate`]: open/closed barrier
//! - [`acquire_any`]: first-available acquisition over several semaphores
//!
//! # Teardown
//!
//! Closing a primitive with parked waiters always drains them: every
//! waiter resumes and observes [`AcquireError::Closed`] instead of a
//! grant.

mod condition;
mod event;
mod gate;
mod rlock;
mod semaphore;
mod thread_event;

pub use condition::Condition;
pub use event::{Event, ValueEvent};
pub use gate::Gate;
pub use rlock::{RLock, RLockGuard, RLockState};
pub use semaphore::{acquire_any, try_acquire_any, AcquireError, Lock, LockGuard, Semaphore};
pub use thread_event::ThreadEvent;
