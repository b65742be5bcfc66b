//! Optional internal thread that detects a `wait_and_process` dispatch pass
//! taking longer than a configured delay. Grounded on `pomp_watchdog.c`: a
//! condition variable timed-wait replaces the original's
//! `pthread_cond_timedwait` against `CLOCK_MONOTONIC`.

use std::{
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

struct State {
    /// Absolute deadline of the dispatch pass currently being monitored, if
    /// any.
    deadline: Option<Instant>,
    /// Bumped on every `enter`, so a stale timeout from a pass that already
    /// left can be told apart from one for the pass currently being timed.
    counter: u64,
    should_stop: bool,
}

/// Watches a loop's dispatch passes for ones that exceed `delay`, invoking a
/// callback once per offending pass from a dedicated thread.
pub struct Watchdog {
    state: Arc<Mutex<State>>,
    condvar: Arc<Condvar>,
    thread: Option<JoinHandle<()>>,
    delay: Duration,
}

impl Watchdog {
    /// Starts the watchdog thread. `cb` is invoked (on the watchdog's own
    /// thread, not the loop's) the first time a monitored pass exceeds
    /// `delay` without a matching [`Watchdog::leave`].
    pub fn start(delay: Duration, mut cb: impl FnMut() + Send + 'static) -> Self {
        let state = Arc::new(Mutex::new(State { deadline: None, counter: 0, should_stop: false }));
        let condvar = Arc::new(Condvar::new());

        let thread_state = state.clone();
        let thread_condvar = condvar.clone();
        let thread = std::thread::Builder::new()
            .name("pomp-watchdog".into())
            .spawn(move || {
                let mut guard = thread_state.lock().expect("watchdog mutex poisoned");
                loop {
                    if guard.should_stop {
                        return;
                    }
                    let Some(deadline) = guard.deadline else {
                        guard = thread_condvar.wait(guard).expect("watchdog mutex poisoned");
                        continue;
                    };
                    let counter = guard.counter;
                    let now = Instant::now();
                    if deadline <= now {
                        drop(guard);
                        cb();
                        guard = thread_state.lock().expect("watchdog mutex poisoned");
                        if guard.counter == counter {
                            guard.deadline = None;
                        }
                        continue;
                    }
                    let (g, timeout) =
                        thread_condvar.wait_timeout(guard, deadline - now).expect("watchdog mutex poisoned");
                    guard = g;
                    if timeout.timed_out() && guard.counter == counter && guard.deadline == Some(deadline) {
                        drop(guard);
                        cb();
                        guard = thread_state.lock().expect("watchdog mutex poisoned");
                        if guard.counter == counter {
                            guard.deadline = None;
                        }
                    }
                }
            })
            .expect("failed to spawn watchdog thread");

        Self { state, condvar, thread: Some(thread), delay }
    }

    /// Marks the start of a dispatch pass to be monitored.
    pub fn enter(&self) {
        let mut guard = self.state.lock().expect("watchdog mutex poisoned");
        guard.counter += 1;
        guard.deadline = Some(Instant::now() + self.delay);
        self.condvar.notify_one();
    }

    /// Marks the end of a dispatch pass: cancels monitoring for it.
    pub fn leave(&self) {
        let mut guard = self.state.lock().expect("watchdog mutex poisoned");
        guard.deadline = None;
        self.condvar.notify_one();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut guard = self.state.lock().expect("watchdog mutex poisoned");
            guard.should_stop = true;
        }
        self.condvar.notify_one();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_when_pass_exceeds_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        let wd = Watchdog::start(Duration::from_millis(10), move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        wd.enter();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wd.leave();
    }

    #[test]
    fn leave_before_deadline_suppresses_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        let wd = Watchdog::start(Duration::from_millis(50), move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        wd.enter();
        wd.leave();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
