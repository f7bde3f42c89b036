//! Open/closed barrier over a [`Lock`].
//!
//! A Gate is open exactly when the underlying lock is free. Closing takes
//! the lock (never parking the closer); `go_through` passes immediately
//! while open and otherwise parks until the gate opens, taking and
//! releasing the lock so every queued caller passes once it does.

use crate::sync::semaphore::{AcquireError, Lock};

/// An open/closed barrier for coroutines of one event loop.
pub struct Gate {
    lock: Lock,
}

impl Gate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self { lock: Lock::new() }
    }

    /// Passes the gate, parking the calling coroutine while it is closed.
    ///
    /// A gate torn down while callers are parked dissolves: those callers
    /// pass. Cancellation still surfaces as an error.
    pub fn go_through(&self) -> Result<(), AcquireError> {
        if !self.lock.is_locked() {
            return Ok(());
        }
        match self.lock.acquire() {
            Ok(()) => {
                self.lock.release();
                Ok(())
            }
            // The lock was torn down under us; the barrier is gone.
            Err(AcquireError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Non-blocking form of [`go_through`](Self::go_through).
    pub fn try_go_through(&self) -> bool {
        self.is_open()
    }

    /// Opens the gate, waking queued `go_through` callers. Idempotent.
    pub fn open(&self) {
        if self.lock.is_locked() {
            self.lock.release();
        }
    }

    /// Closes the gate. Never parks the caller. Idempotent.
    pub fn close(&self) {
        if !self.lock.is_locked() {
            let taken = self.lock.try_acquire();
            debug_assert!(taken, "open gate had no token to take");
        }
    }

    /// True while the gate is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.lock.is_locked()
    }

    /// True while the gate is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock.is_locked()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("open", &self.is_open())
            .field("queued", &self.lock.getting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventLoop;
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex as PlainMutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn gate_starts_open() {
        init_test("gate_starts_open");
        let gate = Gate::new();
        crate::assert_with_log!(gate.is_open(), "open", true, gate.is_open());
        crate::assert_with_log!(gate.try_go_through(), "passes", true, gate.try_go_through());
        let passed = gate.go_through();
        crate::assert_with_log!(passed.is_ok(), "go_through ok", true, passed.is_ok());
        crate::test_complete!("gate_starts_open");
    }

    #[test]
    fn open_and_close_are_idempotent() {
        init_test("open_and_close_are_idempotent");
        let gate = Gate::new();
        gate.close();
        gate.close();
        crate::assert_with_log!(gate.is_closed(), "closed", true, gate.is_closed());
        crate::assert_with_log!(!gate.try_go_through(), "blocked", false, gate.try_go_through());
        gate.open();
        gate.open();
        crate::assert_with_log!(gate.is_open(), "open again", true, gate.is_open());
        crate::test_complete!("open_and_close_are_idempotent");
    }

    #[test]
    fn closed_gate_parks_until_opened() {
        init_test("closed_gate_parks_until_opened");
        let event_loop = EventLoop::new();
        let gate = Arc::new(Gate::new());
        gate.close();
        let log = Arc::new(PlainMutex::new(Vec::<String>::new()));

        for name in ["p1", "p2"] {
            let gate = Arc::clone(&gate);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let result = gate.go_through();
                log.lock().push(format!("{name}:{}", result.is_ok()));
            });
        }
        {
            let gate = Arc::clone(&gate);
            let log = Arc::clone(&log);
            event_loop.call_later(Duration::ZERO, move || {
                log.lock().push("open".to_string());
                gate.open();
            });
        }

        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["open", "p1:true", "p2:true"],
            "both pass after open",
            vec!["open", "p1:true", "p2:true"],
            entries
        );
        crate::assert_with_log!(gate.is_open(), "gate stays open", true, gate.is_open());
        crate::test_complete!("closed_gate_parks_until_opened");
    }

    #[test]
    fn dissolved_gate_lets_parked_callers_pass() {
        init_test("dissolved_gate_lets_parked_callers_pass");
        let event_loop = EventLoop::new();
        let gate = Arc::new(Gate::new());
        gate.close();
        let log = Arc::new(PlainMutex::new(Vec::<String>::new()));

        for name in ["p1", "p2"] {
            let gate = Arc::clone(&gate);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let result = gate.go_through();
                log.lock().push(format!("{name}:{}", result == Ok(())));
            });
        }
        {
            // Tear down the underlying lock while both callers are parked.
            let gate = Arc::clone(&gate);
            event_loop.call_later(Duration::ZERO, move || gate.lock.close());
        }

        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["p1:true", "p2:true"],
            "teardown dissolves the barrier",
            vec!["p1:true", "p2:true"],
            entries
        );
        crate::test_complete!("dissolved_gate_lets_parked_callers_pass");
    }

    #[test]
    fn cancelled_caller_does_not_pass() {
        init_test("cancelled_caller_does_not_pass");
        let event_loop = EventLoop::new();
        let gate = Arc::new(Gate::new());
        gate.close();
        let log = Arc::new(PlainMutex::new(Vec::<String>::new()));

        let caller = {
            let gate = Arc::clone(&gate);
            let log = Arc::clone(&log);
            event_loop.spawn(move || {
                let result = gate.go_through();
                log.lock().push(format!(
                    "caller:{}",
                    result == Err(AcquireError::Cancelled)
                ));
            })
        };
        {
            let target = caller.clone();
            event_loop.call_later(Duration::ZERO, move || target.cancel());
        }
        {
            let gate = Arc::clone(&gate);
            event_loop.call_later(Duration::ZERO, move || gate.open());
        }

        event_loop.run();

        let entries = log.lock().clone();
        crate::assert_with_log!(
            entries == ["caller:true"],
            "cancellation surfaced, not remapped",
            vec!["caller:true"],
            entries
        );
        crate::assert_with_log!(gate.is_open(), "gate opened", true, gate.is_open());
        crate::test_complete!("cancelled_caller_does_not_pass");
    }
}
