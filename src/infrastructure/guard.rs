use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct GuardState {
    closed: bool,
    in_flight: usize,
}

/// Shutdown-safe execution gate.
///
/// Every long-lived component brackets its operations with this guard instead
/// of a plain "running" flag: a flag races between check and act, while the
/// guard counts admitted operations and lets `disable_execute` wait for them
/// to drain. Once `disable_execute` returns `true`, no further operation can
/// be admitted and none is still in flight, so resource teardown (closing
/// sockets, files) is safe to run immediately afterwards.
#[derive(Debug, Default)]
pub struct ExecutionGuard {
    state: Mutex<GuardState>,
    drained: Condvar,
}

/// RAII entry token; dropping it exits the guarded section on every path,
/// including panics.
#[must_use = "the guarded section ends when the permit is dropped"]
pub struct ExecutionPermit<'a> {
    guard: &'a ExecutionGuard,
}

impl Drop for ExecutionPermit<'_> {
    fn drop(&mut self) {
        self.guard.exit_execute();
    }
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scoped entry: `Some` while the gate is open, `None` once disabled.
    pub fn enter(&self) -> Option<ExecutionPermit<'_>> {
        if self.enter_execute() {
            Some(ExecutionPermit { guard: self })
        } else {
            None
        }
    }

    /// Marks one operation in flight if the gate is open. Must be paired with
    /// `exit_execute`; prefer `enter` which pairs them automatically.
    pub fn enter_execute(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.in_flight += 1;
        true
    }

    pub fn exit_execute(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
    }

    /// Closes the gate permanently. Returns `true` on the call that performs
    /// the transition and `false` on every later call. Does not return until
    /// all operations admitted before the transition have exited.
    pub fn disable_execute(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        while state.in_flight > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        true
    }

    /// Runs `action` inside the guard; silently a no-op once the gate is
    /// closed.
    pub fn execute<F: FnOnce()>(&self, action: F) {
        if let Some(_permit) = self.enter() {
            action();
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn admits_until_disabled() {
        let guard = ExecutionGuard::new();
        assert!(guard.enter_execute());
        guard.exit_execute();

        assert!(guard.disable_execute());
        assert!(!guard.enter_execute());
        assert!(guard.enter().is_none());
    }

    #[test]
    fn disable_transitions_exactly_once() {
        let guard = ExecutionGuard::new();
        assert!(guard.disable_execute());
        assert!(!guard.disable_execute());
        assert!(!guard.disable_execute());
    }

    #[test]
    fn execute_is_silent_after_disable() {
        let guard = ExecutionGuard::new();
        let ran = AtomicUsize::new(0);

        guard.execute(|| {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        guard.disable_execute();
        guard.execute(|| {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disable_waits_for_in_flight_operations() {
        let guard = Arc::new(ExecutionGuard::new());
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = mpsc::channel();

        let worker = {
            let guard = Arc::clone(&guard);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let _permit = guard.enter().expect("gate should be open");
                entered_tx.send(()).expect("test channel");
                thread::sleep(Duration::from_millis(200));
                finished.store(true, Ordering::SeqCst);
            })
        };

        entered_rx.recv().expect("worker never entered");
        assert!(guard.disable_execute());
        // disable_execute may only return once the worker has exited
        assert!(finished.load(Ordering::SeqCst));
        worker.join().expect("worker panicked");
    }

    #[test]
    fn permit_exits_on_panic() {
        let guard = Arc::new(ExecutionGuard::new());
        let g = Arc::clone(&guard);
        let result = thread::spawn(move || {
            let _permit = g.enter().expect("gate should be open");
            panic!("boom");
        })
        .join();
        assert!(result.is_err());

        // the panicked permit must have exited, otherwise this would hang
        assert!(guard.disable_execute());
    }
}
