//! The external lock capability consumed by the lease runner.
//!
//! A backend stores one [`LeaderElectionRecord`] per [`Role`] and supports a
//! versioned compare-and-set on it. All cross-process shared state lives
//! behind this trait; the elector itself keeps no connection state beyond the
//! handle returned by [`LockBackend::connect`].

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ElectionError, ElectionResult};
use crate::identity::{Identity, Role};

/// The lease as stored in the lock backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderElectionRecord {
    /// Current holder; empty once the lease has been released.
    pub holder_identity: String,
    /// Lease validity in milliseconds, counted from the last observed change.
    pub lease_duration_ms: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    /// Number of times the holder has changed.
    pub leader_transitions: u32,
}

impl LeaderElectionRecord {
    pub fn new(holder: &Identity, lease_duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_identity: holder.as_str().to_owned(),
            lease_duration_ms: u64::try_from(lease_duration.as_millis())
                .unwrap_or(u64::MAX)
                .max(1),
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        }
    }

    pub fn is_held_by(&self, identity: &Identity) -> bool {
        self.holder_identity == identity.as_str()
    }

    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty()
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
}

/// A record together with the backend revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

/// Storage operations on a single role's lease.
#[async_trait]
pub trait LeaseLock: Send + Sync + fmt::Debug + 'static {
    /// Read the current record, `None` if the lease was never created.
    async fn get(&self) -> ElectionResult<Option<Versioned<LeaderElectionRecord>>>;

    /// Create the record. Fails if it already exists.
    async fn create(&self, record: &LeaderElectionRecord) -> ElectionResult<u64>;

    /// Replace the record if it is still at `revision`.
    async fn update(&self, record: &LeaderElectionRecord, revision: u64) -> ElectionResult<u64>;

    /// Human readable description of where the lease lives, for logs.
    fn describe(&self) -> String;
}

/// Builds the [`LeaseLock`] for a role. Runs once per `run`; an error here is
/// fatal and returned to the caller.
#[async_trait]
pub trait LockBackend: Send + Sync + fmt::Debug + 'static {
    async fn connect(&self, role: &Role, identity: &Identity)
    -> ElectionResult<Arc<dyn LeaseLock>>;
}

/// Encode a record as JSON for the backend.
pub fn encode(record: &LeaderElectionRecord) -> ElectionResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| ElectionError::Codec(e.to_string()))
}

/// Decode a JSON record read from the backend.
pub fn decode(data: &[u8]) -> ElectionResult<LeaderElectionRecord> {
    serde_json::from_slice(data).map_err(|e| ElectionError::Codec(e.to_string()))
}
