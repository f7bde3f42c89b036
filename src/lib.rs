//! Coroutine-aware synchronization primitives for a cooperative
//! event-loop runtime.
//!
//! The [`runtime`] module supplies the substrate: an [`EventLoop`] with a
//! deferred-callback queue and cooperative [`Coroutine`]s that suspend via
//! [`yield_now`] and resume with a [`WakeReason`]. The [`sync`] module
//! builds the primitives on top: [`Semaphore`]/[`Lock`], [`RLock`],
//! [`Condition`], [`Event`], [`ThreadEvent`], [`Gate`], and
//! [`acquire_any`].
//!
//! # Example
//!
//! ```
//! use coopsync::{EventLoop, Semaphore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new();
//! let semaphore = Arc::new(Semaphore::new(1));
//!
//! {
//!     let semaphore = Arc::clone(&semaphore);
//!     event_loop.spawn(move || {
//!         // Parks until the release below is processed.
//!         semaphore.acquire().expect("acquire");
//!     });
//! }
//! assert!(semaphore.try_acquire());
//! {
//!     let semaphore = Arc::clone(&semaphore);
//!     event_loop.call_later(Duration::ZERO, move || semaphore.release());
//! }
//! event_loop.run();
//! assert!(semaphore.is_locked());
//! ```
//!
//! # Scheduling model
//!
//! One coroutine runs at a time per loop; suspension points are explicit
//! (`acquire`, `wait`, `go_through`, `join`). Cancellation is delivered at
//! suspension points via [`Coroutine::cancel`] and surfaces as
//! [`AcquireError::Cancelled`] after the primitive's bookkeeping has been
//! restored. Only [`ThreadEvent`] may be shared across OS threads.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod runtime;
pub mod sync;
pub mod test_utils;
pub mod tracing_compat;

pub use config::{ConfigError, LoopConfig};
pub use runtime::{
    yield_now, CallbackId, Coroutine, CoroutineId, EventLoop, LoopId, WakeReason, WeakCoroutine,
};
pub use sync::{
    acquire_any, try_acquire_any, AcquireError, Condition, Event, Gate, Lock, LockGuard, RLock,
    RLockGuard, RLockState, Semaphore, ThreadEvent, ValueEvent,
};
