//! The leader elector and the leadership loop it drives.
//!
//! ```text
//! Idle -> Candidate -> Leading -> Candidate -> ... -> Terminated
//! ```
//!
//! Started-leading callbacks for a session run serially on one blocking task,
//! away from the renewal heartbeat. Stopped-leading callbacks run serially on
//! the task that called [`LeaderElector::run`], once the session token has
//! been cancelled and the session's start pass has returned, and before the
//! next acquisition attempt.
//!
//! When `run` returns normally, one final stop pass runs unless a stop pass
//! already followed the most recent start pass. An instance that never led
//! therefore still sees exactly one stop pass at shutdown.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::callbacks::CallbackRegistry;
use crate::config::ElectionConfig;
use crate::error::{ElectionError, ElectionResult};
use crate::identity::{Identity, Role};
use crate::lease::{ElectionTimings, LeaseEvents, LeaseRunner, SessionEnd};
use crate::lock::LockBackend;
use crate::metrics;

/// Where an elector is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, `run` not yet called.
    Idle,
    /// Trying to acquire the lease.
    Candidate,
    /// Holding a leadership session.
    Leading,
    /// `run` has returned.
    Terminated,
}

/// State shared between the elector handle and the loop's spawned tasks.
#[derive(Debug)]
struct Shared {
    callbacks: CallbackRegistry,
    phase: watch::Sender<Phase>,
    leader: Arc<watch::Sender<Option<String>>>,
}

/// Coordinates a fleet of redundant instances so exactly one runs the
/// singleton work registered through the callbacks at a time, modulo a
/// bounded handover window.
#[derive(Debug)]
pub struct LeaderElector {
    identity: Identity,
    role: Role,
    timings: ElectionTimings,
    backend: Arc<dyn LockBackend>,
    shared: Arc<Shared>,
    running: AtomicBool,
}

impl LeaderElector {
    /// Elector for `role` with a generated identity and default timings.
    pub fn new<B: LockBackend>(backend: B, role: Role) -> Self {
        Self::with_backend(Arc::new(backend), role)
    }

    pub fn with_backend(backend: Arc<dyn LockBackend>, role: Role) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        let (leader, _) = watch::channel(None);
        Self {
            identity: Identity::generate(),
            role,
            timings: ElectionTimings::default(),
            backend,
            shared: Arc::new(Shared {
                callbacks: CallbackRegistry::new(),
                phase,
                leader: Arc::new(leader),
            }),
            running: AtomicBool::new(false),
        }
    }

    /// Build an elector from file configuration.
    pub fn from_config(config: &ElectionConfig) -> ElectionResult<Self> {
        let mut elector = Self::with_backend(config.backend.build(), config.role.clone())
            .with_timings(config.timings.timings()?)?;
        if let Some(id) = &config.identity {
            elector = elector.with_identity(Identity::new(id.clone())?);
        }
        Ok(elector)
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_timings(mut self, timings: ElectionTimings) -> ElectionResult<Self> {
        timings.validate()?;
        self.timings = timings;
        Ok(self)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn timings(&self) -> &ElectionTimings {
        &self.timings
    }

    /// Register a callback run, in registration order, each time this
    /// instance becomes leader. It receives the session token and must return
    /// promptly; long-running work belongs on a task that watches the token.
    pub fn add_on_started_leading<F>(&self, cb: F)
    where
        F: Fn(CancellationToken) + Send + Sync + 'static,
    {
        self.shared.callbacks.add_on_started_leading(cb);
    }

    /// Register a callback run, in registration order, each time a session
    /// ends, and once when `run` returns if no session end was reported since
    /// the last start.
    pub fn add_on_stopped_leading<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.callbacks.add_on_stopped_leading(cb);
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    /// Receiver of phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.shared.phase.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.phase() == Phase::Leading
    }

    /// Identity of the most recently observed lease holder.
    pub fn leader(&self) -> Option<String> {
        self.shared.leader.borrow().clone()
    }

    /// Participate in the election until `token` is cancelled.
    ///
    /// Returns `Ok(())` after cancellation. Returns an error only if the lock
    /// backend could not be initialized, in which case no callback runs.
    ///
    /// Cancel `token` to stop. Dropping the returned future instead cancels
    /// the current session token, but skips the stop callbacks and leaves the
    /// lease to expire rather than releasing it.
    pub async fn run(&self, token: CancellationToken) -> ElectionResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ElectionError::AlreadyRunning(self.role.to_string()));
        }
        let _running = RunningGuard(&self.running);

        set_phase(&self.shared, Phase::Candidate);
        info!(identity = %self.identity, role = %self.role, "starting leader election");

        let connect = self.backend.connect(&self.role, &self.identity);
        let lock = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            lock = connect => Some(lock),
        };
        let lock = match lock {
            Some(Ok(lock)) => Some(lock),
            Some(Err(err)) => {
                error!(role = %self.role, error = %err, "failed to initialize lock backend");
                set_phase(&self.shared, Phase::Terminated);
                return Err(err);
            }
            None => None,
        };

        let leadership = LeadershipLoop {
            shared: Arc::clone(&self.shared),
            start_pass: Mutex::new(None),
            stop_pending: AtomicBool::new(true),
        };
        if let Some(lock) = lock {
            let runner = LeaseRunner::new(
                lock,
                self.identity.clone(),
                self.timings,
                Arc::clone(&self.shared.leader),
            );
            leadership.run(&runner, &token).await;
        }
        leadership.finish();

        set_phase(&self.shared, Phase::Terminated);
        info!(identity = %self.identity, role = %self.role, "leader election stopped");
        Ok(())
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn set_phase(shared: &Shared, phase: Phase) {
    let previous = shared.phase.send_replace(phase);
    if previous != phase {
        debug!(?previous, ?phase, "leader election phase changed");
    }
}

/// Reacts to lease events by dispatching callbacks. Lives for one `run`.
struct LeadershipLoop {
    shared: Arc<Shared>,
    start_pass: Mutex<Option<JoinHandle<()>>>,
    /// true when a start pass (or `run` itself) has not yet been followed by
    /// a stop pass
    stop_pending: AtomicBool,
}

impl LeadershipLoop {
    async fn run(&self, runner: &LeaseRunner, token: &CancellationToken) {
        while !token.is_cancelled() {
            match runner.run(token, self).await {
                Some(SessionEnd::Lost) => debug!("re-entering candidacy after losing leadership"),
                Some(SessionEnd::Cancelled) | None => break,
            }
        }
    }

    /// Stop pass at shutdown, unless one already followed the last start.
    fn finish(&self) {
        if self.stop_pending.swap(false, Ordering::SeqCst) {
            debug!("running stopped-leading callbacks at shutdown");
            self.shared.callbacks.fire_stopped();
        }
    }
}

#[async_trait]
impl LeaseEvents for LeadershipLoop {
    fn on_acquired(&self, session: CancellationToken) {
        self.stop_pending.store(true, Ordering::SeqCst);
        metrics::LEADER_ELECTION_IS_LEADER.set(1);
        metrics::LEADER_ELECTION_TRANSITIONS.inc();
        set_phase(&self.shared, Phase::Leading);
        info!("became leader, running started-leading callbacks");

        let shared = Arc::clone(&self.shared);
        let pass = tokio::task::spawn_blocking(move || shared.callbacks.fire_started(&session));
        *self.start_pass.lock() = Some(pass);
    }

    async fn on_lost(&self) {
        metrics::LEADER_ELECTION_IS_LEADER.set(0);
        metrics::LEADER_ELECTION_LOSSES.inc();
        set_phase(&self.shared, Phase::Candidate);

        let pass = self.start_pass.lock().take();
        if let Some(pass) = pass {
            if let Err(err) = pass.await {
                error!(?err, "started-leading callback panicked");
            }
        }

        info!("stopped leading, running stopped-leading callbacks");
        self.stop_pending.store(false, Ordering::SeqCst);
        self.shared.callbacks.fire_stopped();
    }
}
