//! # leader-election
//!
//! Lease-based leader election for fleets of redundant processes.
//!
//! Candidates compete for a time-bounded lease held by an external lock
//! backend. The instance holding the lease runs the singleton work that
//! application code registers through ordered callbacks:
//!
//! - **started-leading** callbacks receive a session token and run, in
//!   registration order, each time this instance becomes leader.
//! - **stopped-leading** callbacks run, in registration order, each time a
//!   session ends, after its token has been cancelled.
//!
//! Mutual exclusion is not guaranteed during handover. A leader that stops
//! renewing may keep acting until it notices, while a successor may acquire
//! the lease once it has expired; the overlap is bounded by the lease
//! duration.
//!
//! ```no_run
//! use leader_election::{LeaderElector, MemoryBackend, Role};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), leader_election::ElectionError> {
//! let elector = LeaderElector::new(MemoryBackend::new(), Role::new("default", "gc"));
//! elector.add_on_started_leading(|session| {
//!     tokio::spawn(async move { session.cancelled().await });
//! });
//! elector.add_on_stopped_leading(|| tracing::info!("no longer leading"));
//! elector.run(CancellationToken::new()).await
//! # }
//! ```
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod callbacks;
pub mod config;
pub mod elector;
pub mod error;
pub mod identity;
pub mod lease;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod nats;

pub use callbacks::CallbackRegistry;
pub use config::{BackendConfig, ElectionConfig, NatsConfig, SecurityMode, TimingsConfig};
pub use elector::{LeaderElector, Phase};
pub use error::{ElectionError, ElectionResult};
pub use identity::{Identity, Role};
pub use lease::{ElectionTimings, LeaseEvents, LeaseRunner, SessionEnd};
pub use lock::{LeaderElectionRecord, LeaseLock, LockBackend, Versioned};
pub use memory::{MemoryBackend, MemoryLock};
pub use nats::{NatsBackend, NatsLock};
