// Metrics for the coordination recipes
// Recorded through the `metrics` facade; no-ops until a recorder is installed

use metrics::{describe_counter, describe_gauge};

pub const MUTEX_ACQUIRED: &str = "concord_mutex_acquired_total";
pub const MUTEX_RELEASED: &str = "concord_mutex_released_total";
pub const MUTEX_FAILED: &str = "concord_mutex_failed_total";
pub const QUEUE_ENQUEUED: &str = "concord_queue_enqueued_total";
pub const QUEUE_DEQUEUED: &str = "concord_queue_dequeued_total";
pub const QUEUE_DEQUEUE_CONFLICTS: &str = "concord_queue_dequeue_conflicts_total";
pub const SESSION_KEEPALIVE_FAILURES: &str = "concord_session_keepalive_failures_total";
pub const SESSIONS_ALIVE: &str = "concord_sessions_alive";

/// Register metric descriptions. Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        MUTEX_ACQUIRED,
        "Mutex acquisitions, labelled by path (fast or wait)"
    );
    describe_counter!(MUTEX_RELEASED, "Mutex unlock calls that reached the store");
    describe_counter!(
        MUTEX_FAILED,
        "Lock attempts that failed or were canceled"
    );
    describe_counter!(QUEUE_ENQUEUED, "Items written to queues");
    describe_counter!(QUEUE_DEQUEUED, "Items removed from queues");
    describe_counter!(
        QUEUE_DEQUEUE_CONFLICTS,
        "Dequeue attempts that lost the race for an item and retried"
    );
    describe_counter!(
        SESSION_KEEPALIVE_FAILURES,
        "Failed lease renewals across all sessions"
    );
    describe_gauge!(SESSIONS_ALIVE, "Sessions whose keep-alive task is running");
}
