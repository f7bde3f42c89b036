//! The cooperative runtime substrate: event loops and coroutines.
//!
//! An [`EventLoop`] owns a deferred-callback queue and schedules
//! [`Coroutine`]s one at a time. Coroutines suspend with [`yield_now`],
//! which hands control back to whichever context resumed them and reports
//! *why* they were woken as a [`WakeReason`]. The synchronization
//! primitives in [`crate::sync`] are built entirely on this interface:
//! they park the current coroutine on their waiter queues and wake it
//! through callbacks scheduled on the loop.

pub(crate) mod coroutine;
pub(crate) mod event_loop;

pub use coroutine::{yield_now, Coroutine, CoroutineId, WakeReason, WeakCoroutine};
pub use event_loop::{CallbackId, EventLoop, LoopId};
