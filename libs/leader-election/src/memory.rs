//! In-process lock backend.
//!
//! Every elector connected to the same [`MemoryBackend`] competes for the same
//! leases, which makes it usable for several electors inside one process and
//! for tests. Availability can be toggled to simulate a backend outage.

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ElectionError, ElectionResult};
use crate::identity::{Identity, Role};
use crate::lock::{LeaderElectionRecord, LeaseLock, LockBackend, Versioned};

#[derive(Debug, Default)]
struct Inner {
    leases: Mutex<HashMap<Role, Versioned<LeaderElectionRecord>>>,
    unavailable: AtomicBool,
}

/// Shared in-memory lease table keyed by [`Role`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every lock operation fails with
    /// [`ElectionError::NotConnected`].
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::SeqCst)
    }

    /// Current record for `role`, bypassing availability.
    pub fn record(&self, role: &Role) -> Option<Versioned<LeaderElectionRecord>> {
        self.inner.leases.lock().get(role).cloned()
    }

    /// Lock handle for `role` without going through [`LockBackend::connect`].
    pub fn lock(&self, role: Role) -> MemoryLock {
        MemoryLock {
            inner: Arc::clone(&self.inner),
            role,
        }
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn connect(
        &self,
        role: &Role,
        identity: &Identity,
    ) -> ElectionResult<Arc<dyn LeaseLock>> {
        debug!(%role, %identity, "using in-memory lease lock");
        Ok(Arc::new(self.lock(role.clone())))
    }
}

/// One role's lease inside a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryLock {
    inner: Arc<Inner>,
    role: Role,
}

impl MemoryLock {
    fn check_available(&self) -> ElectionResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(ElectionError::NotConnected(format!(
                "memory lock for {} is unavailable",
                self.role
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseLock for MemoryLock {
    async fn get(&self) -> ElectionResult<Option<Versioned<LeaderElectionRecord>>> {
        self.check_available()?;
        Ok(self.inner.leases.lock().get(&self.role).cloned())
    }

    async fn create(&self, record: &LeaderElectionRecord) -> ElectionResult<u64> {
        self.check_available()?;
        let mut guard = self.inner.leases.lock();
        if let Some(existing) = guard.get(&self.role) {
            return Err(ElectionError::Conflict {
                expected: 0,
                actual: existing.revision,
            });
        }
        guard.insert(
            self.role.clone(),
            Versioned {
                value: record.clone(),
                revision: 1,
            },
        );
        Ok(1)
    }

    async fn update(&self, record: &LeaderElectionRecord, revision: u64) -> ElectionResult<u64> {
        self.check_available()?;
        let mut guard = self.inner.leases.lock();
        let current = guard.get_mut(&self.role).ok_or(ElectionError::Conflict {
            expected: revision,
            actual: 0,
        })?;
        if current.revision != revision {
            return Err(ElectionError::Conflict {
                expected: revision,
                actual: current.revision,
            });
        }
        current.value = record.clone();
        current.revision += 1;
        Ok(current.revision)
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(holder: &str) -> LeaderElectionRecord {
        LeaderElectionRecord::new(&Identity::new(holder).unwrap(), Duration::from_secs(15))
    }

    #[tokio::test]
    async fn test_create_then_conflicting_create() {
        let backend = MemoryBackend::new();
        let lock = backend.lock(Role::new("default", "gc"));

        assert!(lock.get().await.unwrap().is_none());
        assert_eq!(lock.create(&record("a")).await.unwrap(), 1);
        let err = lock.create(&record("b")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(lock.get().await.unwrap().unwrap().value.holder_identity, "a");
    }

    #[tokio::test]
    async fn test_update_compare_and_set() {
        let backend = MemoryBackend::new();
        let lock = backend.lock(Role::new("default", "gc"));
        lock.create(&record("a")).await.unwrap();

        assert_eq!(lock.update(&record("b"), 1).await.unwrap(), 2);
        let err = lock.update(&record("c"), 1).await.unwrap_err();
        assert!(matches!(
            err,
            ElectionError::Conflict {
                expected: 1,
                actual: 2
            }
        ));
        assert_eq!(lock.get().await.unwrap().unwrap().value.holder_identity, "b");
    }

    #[tokio::test]
    async fn test_roles_are_independent() {
        let backend = MemoryBackend::new();
        let gc = backend.lock(Role::new("default", "gc"));
        let sync = backend.lock(Role::new("default", "sync"));
        gc.create(&record("a")).await.unwrap();
        assert!(sync.get().await.unwrap().is_none());
        assert!(backend.record(&Role::new("default", "gc")).is_some());
    }

    #[tokio::test]
    async fn test_unavailable_backend_rejects_operations() {
        let backend = MemoryBackend::new();
        let lock = backend.lock(Role::new("default", "gc"));
        backend.set_available(false);
        assert!(!backend.is_available());
        assert!(matches!(
            lock.get().await,
            Err(ElectionError::NotConnected(_))
        ));
        assert!(lock.create(&record("a")).await.is_err());

        backend.set_available(true);
        assert!(lock.create(&record("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_shares_state() {
        let backend = MemoryBackend::new();
        let role = Role::new("default", "gc");
        let id = Identity::new("a").unwrap();
        let lock = backend.connect(&role, &id).await.unwrap();
        lock.create(&record("a")).await.unwrap();
        assert_eq!(backend.record(&role).unwrap().revision, 1);
        assert_eq!(lock.describe(), "memory/default/gc");
    }
}
