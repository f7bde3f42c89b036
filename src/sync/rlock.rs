//! Re-entrant lock with owner tracking.
//!
//! An [`RLock`] may be acquired repeatedly by the coroutine that holds it;
//! it is released once the matching number of `release` calls has been
//! made. [`reset`](RLock::reset) / [`restore`](RLock::restore) exist to
//! drop the lock around a blocking call without losing the recursion
//! depth.

use parking_lot::Mutex;

use crate::runtime::{Coroutine, CoroutineId};
use crate::sync::semaphore::{AcquireError, Lock};
use crate::tracing_compat::warn;

/// Ownership state captured by [`RLock::reset`] and put back by
/// [`RLock::restore`].
#[derive(Debug)]
#[must_use = "dropping the state loses the saved recursion depth"]
pub struct RLockState {
    holder: Option<CoroutineId>,
    counter: u32,
}

impl RLockState {
    /// Recursion depth at the time of capture.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.counter
    }
}

struct Owner {
    holder: Option<CoroutineId>,
    counter: u32,
}

/// A re-entrant lock for coroutines of one event loop.
pub struct RLock {
    lock: Lock,
    owner: Mutex<Owner>,
}

impl RLock {
    /// Creates an unowned lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: Lock::new(),
            owner: Mutex::new(Owner {
                holder: None,
                counter: 0,
            }),
        }
    }

    /// Acquires the lock, incrementing the depth when the caller already
    /// holds it, parking otherwise while another coroutine does.
    pub fn acquire(&self) -> Result<(), AcquireError> {
        let current = Coroutine::current().expect("RLock::acquire outside a coroutine");
        {
            let mut owner = self.owner.lock();
            if owner.holder == Some(current.id()) {
                owner.counter += 1;
                return Ok(());
            }
        }
        self.lock.acquire()?;
        let mut owner = self.owner.lock();
        owner.holder = Some(current.id());
        owner.counter = 1;
        Ok(())
    }

    /// Non-blocking form of [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> bool {
        let Some(current) = Coroutine::current() else {
            return false;
        };
        {
            let mut owner = self.owner.lock();
            if owner.holder == Some(current.id()) {
                owner.counter += 1;
                return true;
            }
        }
        if !self.lock.try_acquire() {
            return false;
        }
        let mut owner = self.owner.lock();
        owner.holder = Some(current.id());
        owner.counter = 1;
        true
    }

    /// Releases one level of recursion. A release by a coroutine that is
    /// not the holder is logged and ignored.
    pub fn release(&self) {
        let current = Coroutine::current().map(|c| c.id());
        let mut owner = self.owner.lock();
        if owner.holder.is_none() || owner.holder != current {
            warn!("releasing an RLock held by another coroutine; ignored");
            return;
        }
        owner.counter -= 1;
        if owner.counter == 0 {
            owner.holder = None;
            drop(owner);
            self.lock.release();
        }
    }

    /// Acquires and returns a guard that releases one level on drop.
    pub fn lock(&self) -> Result<RLockGuard<'_>, AcquireError> {
        self.acquire()?;
        Ok(RLockGuard { rlock: self })
    }

    /// Captures and clears the ownership state, releasing the underlying
    /// lock if it was held. Pair with [`restore`](Self::restore) to carry
    /// the recursion depth across a blocking call.
    pub fn reset(&self) -> RLockState {
        let state = {
            let mut owner = self.owner.lock();
            RLockState {
                holder: owner.holder.take(),
                counter: std::mem::take(&mut owner.counter),
            }
        };
        if state.counter > 0 {
            self.lock.release();
        }
        state
    }

    /// Puts back state captured by [`reset`](Self::reset), re-acquiring
    /// the underlying lock (blocking) when the saved depth is positive.
    pub fn restore(&self, state: RLockState) -> Result<(), AcquireError> {
        {
            let mut owner = self.owner.lock();
            owner.holder = state.holder;
            owner.counter = state.counter;
        }
        if state.counter > 0 {
            self.lock.acquire()?;
        }
        Ok(())
    }

    /// True while any coroutine holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// True when the calling coroutine is the holder.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        let Some(current) = Coroutine::current() else {
            return false;
        };
        self.owner.lock().holder == Some(current.id())
    }

    /// Number of coroutines parked on this lock.
    #[must_use]
    pub fn getting(&self) -> usize {
        self.lock.getting()
    }
}

impl Default for RLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owner = self.owner.lock();
        f.debug_struct("RLock")
            .field("holder", &owner.holder)
            .field("depth", &owner.counter)
            .finish()
    }
}

/// Releases one level of its [`RLock`] on drop.
#[must_use = "the lock is released immediately if the guard is not held"]
pub struct RLockGuard<'a> {
    rlock: &'a RLock,
}

impl Drop for RLockGuard<'_> {
    fn drop(&mut self) {
        self.rlock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventLoop;
    use crate::sync::Event;
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex as PlainMutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn recorder() -> Arc<PlainMutex<Vec<String>>> {
        Arc::new(PlainMutex::new(Vec::new()))
    }

    #[test]
    fn recursive_acquire_requires_matching_releases() {
        init_test("recursive_acquire_requires_matching_releases");
        let event_loop = EventLoop::new();
        let rlock = Arc::new(RLock::new());
        let gate_event = Arc::new(Event::new());
        let log = recorder();

        {
            let rlock = Arc::clone(&rlock);
            let gate_event = Arc::clone(&gate_event);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                for _ in 0..3 {
                    let _ = rlock.acquire();
                }
                log.lock().push(format!("a:owned:{}", rlock.is_owned()));
                let _ = gate_event.wait();
                rlock.release();
                rlock.release();
                log.lock().push(format!(
                    "a:still-holding:{}:{}",
                    rlock.is_owned(),
                    rlock.getting()
                ));
                rlock.release();
                log.lock().push("a:done".to_string());
            });
        }
        {
            let rlock = Arc::clone(&rlock);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let result = rlock.acquire();
                log.lock().push(format!(
                    "b:acquired:{}:{}",
                    result.is_ok(),
                    rlock.is_owned()
                ));
                rlock.release();
            });
        }
        {
            let gate_event = Arc::clone(&gate_event);
            event_loop.call_later(Duration::ZERO, move || gate_event.set());
        }

        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries
                == [
                    "a:owned:true",
                    "a:still-holding:true:1",
                    "a:done",
                    "b:acquired:true:true",
                ],
            "three releases hand over the lock",
            vec![
                "a:owned:true",
                "a:still-holding:true:1",
                "a:done",
                "b:acquired:true:true",
            ],
            entries
        );
        crate::assert_with_log!(!rlock.is_locked(), "unlocked at end", false, rlock.is_locked());
        crate::test_complete!("recursive_acquire_requires_matching_releases");
    }

    #[test]
    fn release_by_non_owner_is_ignored() {
        init_test("release_by_non_owner_is_ignored");
        let event_loop = EventLoop::new();
        let rlock = Arc::new(RLock::new());
        let gate_event = Arc::new(Event::new());
        let log = recorder();

        {
            let rlock = Arc::clone(&rlock);
            let gate_event = Arc::clone(&gate_event);
            event_loop.spawn(move || {
                let _ = rlock.acquire();
                let _ = gate_event.wait();
                rlock.release();
            });
        }
        {
            let rlock = Arc::clone(&rlock);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                rlock.release(); // not the holder
                log.lock()
                    .push(format!("intruder:still-locked:{}", rlock.is_locked()));
            });
        }
        {
            let gate_event = Arc::clone(&gate_event);
            event_loop.call_later(Duration::ZERO, move || gate_event.set());
        }

        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["intruder:still-locked:true"],
            "foreign release ignored",
            vec!["intruder:still-locked:true"],
            entries
        );
        crate::assert_with_log!(!rlock.is_locked(), "holder released", false, rlock.is_locked());
        crate::test_complete!("release_by_non_owner_is_ignored");
    }

    #[test]
    fn reset_and_restore_carry_the_depth() {
        init_test("reset_and_restore_carry_the_depth");
        let event_loop = EventLoop::new();
        let rlock = Arc::new(RLock::new());
        let log = recorder();

        {
            let rlock = Arc::clone(&rlock);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let _ = rlock.acquire();
                let _ = rlock.acquire();
                let state = rlock.reset();
                log.lock().push(format!(
                    "dropped:{}:{}:{}",
                    state.depth(),
                    rlock.is_locked(),
                    rlock.is_owned()
                ));
                let restored = rlock.restore(state);
                log.lock().push(format!(
                    "restored:{}:{}:{}",
                    restored.is_ok(),
                    rlock.is_locked(),
                    rlock.is_owned()
                ));
                rlock.release();
                rlock.release();
            });
        }

        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["dropped:2:false:false", "restored:true:true:true"],
            "reset/restore round trip",
            vec!["dropped:2:false:false", "restored:true:true:true"],
            entries
        );
        crate::assert_with_log!(!rlock.is_locked(), "fully released", false, rlock.is_locked());
        crate::test_complete!("reset_and_restore_carry_the_depth");
    }

    #[test]
    fn guard_releases_one_level() {
        init_test("guard_releases_one_level");
        let event_loop = EventLoop::new();
        let rlock = Arc::new(RLock::new());
        let log = recorder();

        {
            let rlock = Arc::clone(&rlock);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let _ = rlock.acquire();
                {
                    let guard = rlock.lock();
                    log.lock().push(format!("nested:{}", guard.is_ok()));
                }
                log.lock()
                    .push(format!("after-guard:owned:{}", rlock.is_owned()));
                rlock.release();
            });
        }

        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["nested:true", "after-guard:owned:true"],
            "guard pops one level",
            vec!["nested:true", "after-guard:owned:true"],
            entries
        );
        crate::assert_with_log!(!rlock.is_locked(), "unlocked at end", false, rlock.is_locked());
        crate::test_complete!("guard_releases_one_level");
    }
}
