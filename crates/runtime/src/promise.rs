use parking_lot::Mutex;
use std::sync::Arc;

use volition_core::GoalHandle;

/// Terminal state of a pursued goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Success,
    Failed(String),
}

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PromiseInner {
    state: Option<PromiseState>,
    then: Vec<Callback>,
    otherwise: Vec<Callback>,
}

/// Completion notifier for a pursued goal, resolved exactly once with
/// either success or failure. Callbacks registered after resolution fire
/// immediately.
#[derive(Clone)]
pub struct GoalPromise {
    inner: Arc<Mutex<PromiseInner>>,
}

impl GoalPromise {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseInner {
                state: Some(PromiseState::Pending),
                then: Vec::new(),
                otherwise: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> PromiseState {
        self.inner
            .lock()
            .state
            .clone()
            .unwrap_or(PromiseState::Pending)
    }

    pub fn resolved(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    /// Run `f` when the goal succeeds.
    pub fn then(&self, f: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        match inner.state {
            Some(PromiseState::Success) => {
                drop(inner);
                f();
            }
            Some(PromiseState::Failed(_)) => {}
            _ => inner.then.push(Box::new(f)),
        }
    }

    /// Run `f` when the goal fails or is dropped.
    pub fn otherwise(&self, f: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        match inner.state {
            Some(PromiseState::Failed(_)) => {
                drop(inner);
                f();
            }
            Some(PromiseState::Success) => {}
            _ => inner.otherwise.push(Box::new(f)),
        }
    }

    /// Resolve the promise. A second resolution is ignored with a warning;
    /// a promise fires exactly once.
    pub fn resolve(&self, state: PromiseState) {
        debug_assert!(state != PromiseState::Pending);
        let callbacks = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, Some(PromiseState::Pending)) {
                tracing::warn!("Goal promise resolved more than once");
                return;
            }
            let callbacks = match state {
                PromiseState::Success => {
                    inner.otherwise.clear();
                    std::mem::take(&mut inner.then)
                }
                _ => {
                    inner.then.clear();
                    std::mem::take(&mut inner.otherwise)
                }
            };
            inner.state = Some(state);
            callbacks
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl Default for GoalPromise {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of `Agent::pursue`: the desire's handle plus its completion
/// promise.
#[derive(Clone)]
pub struct GoalPursue {
    pub handle: GoalHandle,
    pub promise: GoalPromise,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn resolves_exactly_once() {
        let promise = GoalPromise::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        promise.then(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        promise.resolve(PromiseState::Success);
        promise.resolve(PromiseState::Failed("late".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(promise.state(), PromiseState::Success);
    }

    #[test]
    fn late_registration_fires_immediately() {
        let promise = GoalPromise::new();
        promise.resolve(PromiseState::Failed("no plans".into()));
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        promise.otherwise(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
