//! Acquire, renew and release a leadership lease.
//!
//! [`LeaseRunner::run`] blocks until this candidate has held and then lost the
//! lease, or until the outer token is cancelled. Transient backend errors are
//! logged and retried at the retry period; they never escape the runner.
//!
//! Expiry of another holder's lease is judged on the local monotonic clock,
//! measured from the moment this candidate last saw the record change, so
//! remote timestamps and clock skew do not matter. The price is a bounded
//! window during handover in which a deposed leader that has not yet noticed
//! the loss and its successor both act as leader.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ElectionError, ElectionResult};
use crate::identity::Identity;
use crate::lock::{LeaderElectionRecord, LeaseLock};
use crate::metrics;

/// Default time a lease stays valid without renewal.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Default time the leader keeps retrying a renewal before giving up.
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);

/// Default wait between acquisition or renewal attempts.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Acquisition attempts wait up to `retry_period * (1 + JITTER_FACTOR)`.
pub const JITTER_FACTOR: f64 = 1.2;

/// Lease duration written when a lease is voluntarily released.
const RELEASED_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Timing parameters for the lease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectionTimings {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    /// Release the lease as soon as the outer token is cancelled instead of
    /// letting it expire.
    pub release_on_cancel: bool,
}

impl Default for ElectionTimings {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }
}

impl ElectionTimings {
    pub fn validate(&self) -> ElectionResult<()> {
        if self.lease_duration.is_zero()
            || self.renew_deadline.is_zero()
            || self.retry_period.is_zero()
        {
            return Err(ElectionError::Config(
                "lease duration, renew deadline and retry period must be positive".into(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionError::Config(format!(
                "lease duration {:?} must be greater than renew deadline {:?}",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(ElectionError::Config(format!(
                "renew deadline {:?} must be greater than {JITTER_FACTOR} * retry period {:?}",
                self.renew_deadline, self.retry_period
            )));
        }
        Ok(())
    }
}

/// Notifications from the runner, called on the runner's task. Renewal does
/// not start until `on_acquired` returns, so it must not block.
#[async_trait]
pub trait LeaseEvents: Send + Sync {
    /// The lease was acquired. `session` is cancelled when the session ends.
    fn on_acquired(&self, session: CancellationToken);

    /// The session ended; its token has already been cancelled. The runner
    /// does not attempt to reacquire until this returns.
    async fn on_lost(&self);
}

/// Why a leadership session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A renewal round did not succeed within the renew deadline.
    Lost,
    /// The outer token was cancelled while leading.
    Cancelled,
}

#[derive(Debug, Default)]
struct Observed {
    record: Option<LeaderElectionRecord>,
    revision: u64,
    at: Option<Instant>,
}

/// Drives one candidate's acquire/renew/release cycle against a [`LeaseLock`].
#[derive(Debug)]
pub struct LeaseRunner {
    lock: Arc<dyn LeaseLock>,
    identity: Identity,
    timings: ElectionTimings,
    observed: Mutex<Observed>,
    leader: Arc<watch::Sender<Option<String>>>,
}

impl LeaseRunner {
    /// `leader` receives the holder identity each time a different holder is
    /// observed.
    pub fn new(
        lock: Arc<dyn LeaseLock>,
        identity: Identity,
        timings: ElectionTimings,
        leader: Arc<watch::Sender<Option<String>>>,
    ) -> Self {
        Self {
            lock,
            identity,
            timings,
            observed: Mutex::new(Observed::default()),
            leader,
        }
    }

    /// Acquire the lease, renew it until lost or cancelled, then release it.
    ///
    /// Returns `None` without calling `events` if the token was cancelled
    /// before the lease was acquired. If the future is dropped while leading,
    /// the session token is cancelled but `on_lost` is not called and the
    /// lease is left to expire.
    pub async fn run(
        &self,
        token: &CancellationToken,
        events: &dyn LeaseEvents,
    ) -> Option<SessionEnd> {
        if !self.acquire(token).await {
            return None;
        }

        let session = token.child_token();
        // dropping this future mid-session still ends the session
        let _session_guard = session.clone().drop_guard();
        events.on_acquired(session.clone());

        let end = self.renew(token).await;
        session.cancel();
        if end == SessionEnd::Cancelled && self.timings.release_on_cancel {
            self.release().await;
        }
        events.on_lost().await;
        Some(end)
    }

    async fn acquire(&self, token: &CancellationToken) -> bool {
        let lock = self.lock.describe();
        info!(identity = %self.identity, %lock, "attempting to acquire leader lease");
        loop {
            let acquired = tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                acquired = self.try_acquire_or_renew() => acquired,
            };
            if acquired {
                info!(identity = %self.identity, %lock, "successfully acquired lease");
                return true;
            }
            metrics::LEADER_ELECTION_ACQUIRE_FAILURES.inc();

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.jittered_retry_period()) => {}
            }
        }
    }

    async fn renew(&self, token: &CancellationToken) -> SessionEnd {
        loop {
            tokio::select! {
                _ = token.cancelled() => return SessionEnd::Cancelled,
                _ = tokio::time::sleep(self.timings.retry_period) => {}
            }
            let renewed = tokio::select! {
                biased;
                _ = token.cancelled() => return SessionEnd::Cancelled,
                renewed = self.renew_round() => renewed,
            };
            if !renewed {
                warn!(
                    identity = %self.identity,
                    lock = %self.lock.describe(),
                    renew_deadline = ?self.timings.renew_deadline,
                    "failed to renew lease within deadline, leadership lost"
                );
                return SessionEnd::Lost;
            }
        }
    }

    /// Retry renewal every retry period until it succeeds or the renew
    /// deadline passes.
    async fn renew_round(&self) -> bool {
        let deadline = Instant::now() + self.timings.renew_deadline;
        loop {
            match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                Ok(true) => return true,
                Ok(false) => metrics::LEADER_ELECTION_RENEW_FAILURES.inc(),
                Err(_) => return false,
            }
            let next = Instant::now() + self.timings.retry_period;
            if next >= deadline {
                return false;
            }
            tokio::time::sleep_until(next).await;
        }
    }

    /// Give up the lease if this candidate still holds it, so another
    /// candidate does not have to wait for it to expire.
    async fn release(&self) {
        let (record, revision) = {
            let observed = self.observed.lock();
            match &observed.record {
                Some(record) if record.is_held_by(&self.identity) => {
                    (record.clone(), observed.revision)
                }
                _ => return,
            }
        };

        let released = LeaderElectionRecord {
            holder_identity: String::new(),
            lease_duration_ms: RELEASED_LEASE_DURATION.as_millis() as u64,
            renew_time: Utc::now(),
            ..record
        };
        let update = self.lock.update(&released, revision);
        let result = tokio::time::timeout(self.timings.renew_deadline, update)
            .await
            .unwrap_or_else(|_| {
                Err(ElectionError::Timeout(format!(
                    "release not acknowledged within {:?}",
                    self.timings.renew_deadline
                )))
            });
        match result {
            Ok(revision) => {
                info!(identity = %self.identity, revision, "released leader lease");
                self.observe(released, revision);
            }
            Err(err) => warn!(identity = %self.identity, error = %err, "failed to release lease"),
        }
    }

    /// One compare-and-set attempt to take or extend the lease.
    pub async fn try_acquire_or_renew(&self) -> bool {
        let mut desired = LeaderElectionRecord::new(&self.identity, self.timings.lease_duration);

        let current = match self.lock.get().await {
            Ok(current) => current,
            Err(err) => {
                self.log_lock_error(&err, "error retrieving lease");
                return false;
            }
        };

        let Some(current) = current else {
            return match self.lock.create(&desired).await {
                Ok(revision) => {
                    self.observe(desired, revision);
                    true
                }
                Err(err) => {
                    self.log_lock_error(&err, "error creating lease");
                    false
                }
            };
        };

        self.observe(current.value.clone(), current.revision);
        let record = &current.value;
        if !record.is_released() && !record.is_held_by(&self.identity) && !self.observed_expired() {
            debug!(holder = %record.holder_identity, "lease is held by another candidate and has not yet expired");
            return false;
        }

        if record.is_held_by(&self.identity) {
            desired.acquire_time = record.acquire_time;
            desired.leader_transitions = record.leader_transitions;
        } else {
            desired.leader_transitions = record.leader_transitions.saturating_add(1);
        }

        match self.lock.update(&desired, current.revision).await {
            Ok(revision) => {
                self.observe(desired, revision);
                true
            }
            Err(err) => {
                self.log_lock_error(&err, "error updating lease");
                false
            }
        }
    }

    /// Conflicts are expected under contention. Errors that retrying cannot
    /// fix, such as an unreadable record, are logged at error.
    fn log_lock_error(&self, err: &ElectionError, msg: &str) {
        let lock = self.lock.describe();
        if err.is_conflict() {
            debug!(%lock, error = %err, "{msg}: lost compare-and-set race");
        } else if err.is_retryable() {
            warn!(%lock, error = %err, "{msg}");
        } else {
            error!(%lock, error = %err, "{msg}");
        }
    }

    fn observe(&self, record: LeaderElectionRecord, revision: u64) {
        let holder = (!record.is_released()).then(|| record.holder_identity.clone());
        {
            let mut observed = self.observed.lock();
            if observed.record.as_ref() != Some(&record) {
                observed.record = Some(record);
                observed.at = Some(Instant::now());
            }
            observed.revision = revision;
        }
        self.leader.send_if_modified(|current| {
            if *current != holder {
                if let Some(holder) = &holder {
                    info!(leader = %holder, "new leader observed");
                }
                *current = holder;
                true
            } else {
                false
            }
        });
    }

    fn observed_expired(&self) -> bool {
        let observed = self.observed.lock();
        match (&observed.record, observed.at) {
            (Some(record), Some(at)) => at + record.lease_duration() <= Instant::now(),
            _ => true,
        }
    }

    fn jittered_retry_period(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
        self.timings.retry_period + self.timings.retry_period.mul_f64(jitter)
    }
}
