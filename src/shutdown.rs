use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::MangaError;

#[derive(Debug, Default)]
struct State {
    stopping: bool,
    in_flight: usize,
}

/// Stop signal shared by the downloader and every task it schedules.
///
/// Tasks register through [`Shutdown::begin`]; once [`Shutdown::trigger`] has
/// been called no new task is admitted and pending backoff sleeps wake up.
#[derive(Debug, Default)]
pub struct Shutdown {
    state: Mutex<State>,
    changed: Condvar,
}

/// Keeps a task counted as in flight until dropped.
#[derive(Debug)]
pub struct TaskGuard<'a> {
    shutdown: &'a Shutdown,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, what: &str) -> Result<TaskGuard<'_>, MangaError> {
        let mut state = self.state();
        if state.stopping {
            return Err(MangaError::Interrupted(format!(
                "shutting down, not starting {what}"
            )));
        }
        state.in_flight += 1;
        Ok(TaskGuard { shutdown: self })
    }

    pub fn trigger(&self) {
        self.state().stopping = true;
        self.changed.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.state().stopping
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    /// Sleeps for `duration` unless shutdown is triggered first.
    pub fn sleep(&self, duration: Duration) -> Result<(), MangaError> {
        let deadline = Instant::now() + duration;
        let mut state = self.state();
        loop {
            if state.stopping {
                return Err(MangaError::Interrupted(
                    "shutdown requested during retry backoff".to_string(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Triggers shutdown and waits up to `timeout` for in-flight tasks.
    /// Returns true when everything drained in time.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.trigger();
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while state.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shutdown.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.shutdown.changed.notify_all();
    }
}
