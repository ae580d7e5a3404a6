//! Ordered leadership callbacks.
//!
//! Both lists are append-only. Dispatch takes a snapshot under the read lock
//! and invokes callbacks after the lock is released, so a callback that
//! registers another callback does not deadlock; the new callback is only
//! picked up by the next transition.
//!
//! Callbacks must not panic. A panic in a stopped-leading callback unwinds
//! through [`LeaderElector::run`](crate::LeaderElector::run); a panic in a
//! started-leading callback aborts the rest of that start pass.

use std::{fmt, sync::Arc};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Invoked with the session token once leadership is acquired. The token is
/// cancelled when the session ends and long-running work must watch it.
pub type StartedLeading = Arc<dyn Fn(CancellationToken) + Send + Sync>;

/// Invoked once a session has ended.
pub type StoppedLeading = Arc<dyn Fn() + Send + Sync>;

/// Thread-safe, insertion-ordered callback lists.
#[derive(Default)]
pub struct CallbackRegistry {
    started: RwLock<Vec<StartedLeading>>,
    stopped: RwLock<Vec<StoppedLeading>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_on_started_leading<F>(&self, cb: F)
    where
        F: Fn(CancellationToken) + Send + Sync + 'static,
    {
        self.started.write().push(Arc::new(cb));
    }

    pub fn add_on_stopped_leading<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.stopped.write().push(Arc::new(cb));
    }

    /// Run every started-leading callback in registration order, one at a
    /// time, on the calling thread.
    pub fn fire_started(&self, session: &CancellationToken) {
        let snapshot = self.started.read().clone();
        for cb in snapshot {
            cb(session.clone());
        }
    }

    /// Run every stopped-leading callback in registration order, one at a
    /// time, on the calling thread.
    pub fn fire_stopped(&self) {
        let snapshot = self.stopped.read().clone();
        for cb in snapshot {
            cb();
        }
    }

    pub fn started_len(&self) -> usize {
        self.started.read().len()
    }

    pub fn stopped_len(&self) -> usize {
        self.stopped.read().len()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("started", &self.started_len())
            .field("stopped", &self.stopped_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[test]
    fn test_started_fire_in_registration_order() {
        let registry = CallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c", "d"] {
            let log = Arc::clone(&log);
            registry.add_on_started_leading(move |_| log.lock().push(name));
        }

        registry.fire_started(&CancellationToken::new());
        assert_eq!(*log.lock(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_stopped_fire_in_registration_order() {
        let registry = CallbackRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["x", "y"] {
            let log = Arc::clone(&log);
            registry.add_on_stopped_leading(move || log.lock().push(name));
        }

        registry.fire_stopped();
        registry.fire_stopped();
        assert_eq!(*log.lock(), vec!["x", "y", "x", "y"]);
    }

    #[test]
    fn test_started_receive_session_token() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            registry.add_on_started_leading(move |token| *seen.lock() = Some(token));
        }

        let session = CancellationToken::new();
        registry.fire_started(&session);
        session.cancel();
        assert!(seen.lock().as_ref().unwrap().is_cancelled());
    }

    #[test]
    fn test_reentrant_registration_applies_next_pass() {
        let registry = Arc::new(CallbackRegistry::new());
        let count = Arc::new(Mutex::new(0));
        {
            let weak = Arc::downgrade(&registry);
            let count = Arc::clone(&count);
            registry.add_on_stopped_leading(move || {
                let count = Arc::clone(&count);
                if let Some(registry) = weak.upgrade() {
                    registry.add_on_stopped_leading(move || *count.lock() += 1);
                }
            });
        }

        registry.fire_stopped();
        assert_eq!(*count.lock(), 0);
        assert_eq!(registry.stopped_len(), 2);

        registry.fire_stopped();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_concurrent_registration_loses_nothing() {
        let registry = Arc::new(CallbackRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles = (0..50)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    registry.add_on_started_leading(move |_| log.lock().push(i));
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.started_len(), 50);
        registry.fire_started(&CancellationToken::new());
        let fired = log.lock().clone();
        assert_eq!(fired.len(), 50);
        assert_eq!(fired.iter().collect::<HashSet<_>>().len(), 50);
    }
}
