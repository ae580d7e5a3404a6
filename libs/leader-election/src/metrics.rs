//! Leader election metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered with the default prometheus registry. Registration failures are
//! fatal since they can only come from a duplicate metric name.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Gauge: 1 while this process holds a leadership session, 0 otherwise
    pub static ref LEADER_ELECTION_IS_LEADER: IntGauge = register_int_gauge!(
        "leader_election_is_leader",
        "1 while this process holds a leadership session"
    ).unwrap();

    /// Count of leadership sessions started
    pub static ref LEADER_ELECTION_TRANSITIONS: IntCounter = register_int_counter!(
        "leader_election_transitions",
        "count of leadership sessions started by this process"
    ).unwrap();

    /// Count of leadership sessions ended
    pub static ref LEADER_ELECTION_LOSSES: IntCounter = register_int_counter!(
        "leader_election_losses",
        "count of leadership sessions ended by this process"
    ).unwrap();

    /// Count of acquisition attempts that did not obtain the lease
    pub static ref LEADER_ELECTION_ACQUIRE_FAILURES: IntCounter = register_int_counter!(
        "leader_election_acquire_failures",
        "count of lease acquisition attempts that did not obtain the lease"
    ).unwrap();

    /// Count of renewal attempts that failed while leading
    pub static ref LEADER_ELECTION_RENEW_FAILURES: IntCounter = register_int_counter!(
        "leader_election_renew_failures",
        "count of lease renewal attempts that failed while leading"
    ).unwrap();
}
