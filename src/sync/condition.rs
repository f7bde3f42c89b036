//! Condition variable built on private per-waiter locks.
//!
//! Each waiter constructs a fresh [`Lock`], acquires it once to arm it,
//! queues it, and parks on the second acquire. `notify` releases the
//! oldest private locks, which resumes exactly those waiters through the
//! lock's deferred wake path. FIFO handoff, no herd.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::sync::semaphore::{AcquireError, Lock};

/// A condition variable for coroutines of one event loop.
pub struct Condition {
    waiters: Mutex<VecDeque<Arc<Lock>>>,
}

impl Condition {
    /// Creates a condition with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Parks the calling coroutine until notified.
    ///
    /// Returns `Err(AcquireError::Closed)` when the condition is torn down
    /// under the waiter, and propagates `Err(AcquireError::Cancelled)`
    /// after cleaning up.
    pub fn wait(&self) -> Result<(), AcquireError> {
        let waiter = Arc::new(Lock::new());
        waiter.acquire()?;
        self.waiters.lock().push_back(Arc::clone(&waiter));
        match waiter.acquire() {
            Ok(()) => {
                waiter.release();
                self.remove(&waiter);
                Ok(())
            }
            Err(AcquireError::Cancelled) => {
                // Release before unqueueing: a notify that already popped
                // this waiter must find its lock released.
                waiter.release();
                self.remove(&waiter);
                Err(AcquireError::Cancelled)
            }
            Err(err) => {
                self.remove(&waiter);
                Err(err)
            }
        }
    }

    fn remove(&self, waiter: &Arc<Lock>) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            waiters.remove(pos);
        }
    }

    /// Wakes up to `n` waiters, oldest first.
    pub fn notify(&self, n: usize) {
        let released: SmallVec<[Arc<Lock>; 4]> = {
            let mut waiters = self.waiters.lock();
            let take = n.min(waiters.len());
            waiters.drain(..take).collect()
        };
        for waiter in released {
            waiter.release();
        }
    }

    /// Wakes every current waiter.
    pub fn notify_all(&self) {
        self.notify(self.getting());
    }

    /// Number of parked waiters.
    #[must_use]
    pub fn getting(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Fails every current waiter with [`AcquireError::Closed`]. Used when
    /// the primitive owning this condition is torn down.
    pub fn close(&self) {
        let dropped: SmallVec<[Arc<Lock>; 4]> = {
            let mut waiters = self.waiters.lock();
            waiters.drain(..).collect()
        };
        for waiter in dropped {
            waiter.close();
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        self.notify_all();
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("waiters", &self.getting())
            .finish()
    }
}
