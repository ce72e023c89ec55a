//! Election metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
//! Registration failures are fatal (using `.unwrap()`): a duplicate metric name
//! is a programming error that should surface at startup.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    // --- leadership ---

    /// Count of transitions from follower to leader
    pub static ref LEADERSHIP_ACQUIRED: IntCounter = register_int_counter!(
        "election_leadership_acquired",
        "count of transitions from follower to leader"
    ).unwrap();

    /// Count of transitions from leader to follower (including stop)
    pub static ref LEADERSHIP_LOST: IntCounter = register_int_counter!(
        "election_leadership_lost",
        "count of transitions from leader to follower"
    ).unwrap();

    /// 1 while the most recently updated coordinator in this process is leader
    pub static ref LEADER_STATUS: IntGauge = register_int_gauge!(
        "election_leader_status",
        "leadership flag of this process (1 = leader, 0 = follower)"
    ).unwrap();

    /// Count of fallback recheck ticks
    pub static ref RECHECK_TICKS: IntCounter = register_int_counter!(
        "election_recheck_ticks",
        "count of periodic leadership rechecks"
    ).unwrap();

    // --- watches ---

    /// Count of change notifications dispatched to handlers
    pub static ref WATCH_NOTIFICATIONS: IntCounter = register_int_counter!(
        "election_watch_notifications",
        "count of watch notifications dispatched to handlers"
    ).unwrap();

    /// Count of watch payloads dropped because they could not be decoded
    pub static ref WATCH_MALFORMED: IntCounter = register_int_counter!(
        "election_watch_malformed",
        "count of malformed watch payloads dropped"
    ).unwrap();

    /// Count of failed blocking queries
    pub static ref WATCH_ERRORS: IntCounter = register_int_counter!(
        "election_watch_errors",
        "count of failed watch queries"
    ).unwrap();

    /// Number of running watch subscriptions
    pub static ref WATCH_ACTIVE: IntGauge = register_int_gauge!(
        "election_watch_active",
        "number of running watch subscriptions"
    ).unwrap();

    // --- sessions ---

    /// Count of successful session renewals
    pub static ref SESSION_RENEWALS: IntCounter = register_int_counter!(
        "election_session_renewals",
        "count of successful session renewals"
    ).unwrap();

    /// Count of failed session renewals
    pub static ref SESSION_RENEW_FAILURES: IntCounter = register_int_counter!(
        "election_session_renew_failures",
        "count of failed session renewals"
    ).unwrap();
}
