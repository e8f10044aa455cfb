//! State shared between a session's worker and its completion callbacks.

use common::Error;
use parking_lot::{Condvar, Mutex, MutexGuard};

/// Per-session buffer and throttle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub block_size: usize,
    /// Throttle checks between two concurrency queries.
    pub recheck_interval: u32,
}

/// Result of a session as observed so far.
///
/// The first failure recorded wins and is never replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Outcome {
    #[default]
    Pending,
    Failed(Error),
    Succeeded,
}

impl Outcome {
    /// Records `error` unless the session already failed. Returns whether it
    /// was recorded.
    pub fn fail(&mut self, error: Error) -> bool {
        if let Outcome::Failed(first) = self {
            tracing::debug!("dropping {error}, session already failed with {first}");
            return false;
        }
        *self = Outcome::Failed(error);
        true
    }

    pub fn succeed(&mut self) {
        if *self == Outcome::Pending {
            *self = Outcome::Succeeded;
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Fails with the recorded error, if any. Every wait point calls this.
    pub fn check(&self) -> Result<(), Error> {
        match self.error() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// A mutex with a condition variable, woken on every state change.
#[derive(Debug)]
pub struct Monitor<S> {
    state: Mutex<S>,
    changed: Condvar,
}

impl<S> Monitor<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock()
    }

    /// Blocks until some other thread changes the state.
    pub fn wait(&self, guard: &mut MutexGuard<'_, S>) {
        self.changed.wait(guard);
    }

    /// Applies `change` and wakes all waiters. Used by completion callbacks,
    /// which must not block beyond taking the lock.
    pub fn update<R>(&self, change: impl FnOnce(&mut S) -> R) -> R {
        let result = change(&mut self.state.lock());
        self.changed.notify_all();
        result
    }
}
