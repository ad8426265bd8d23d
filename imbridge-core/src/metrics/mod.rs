//! Session metrics
//!
//! Counters recorded through the `metrics` facade. Nothing is exported from
//! this crate; the embedding process installs whatever recorder it wants.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const MESSAGES_RECEIVED: &str = "imbridge_messages_received_total";
pub const MESSAGES_SENT: &str = "imbridge_messages_sent_total";
pub const MESSAGES_CONFIRMED: &str = "imbridge_messages_confirmed_total";
pub const AUTH_FAILURES: &str = "imbridge_auth_failures_total";
pub const RECONNECTS: &str = "imbridge_reconnects_total";
pub const OPERATION_TIMEOUTS: &str = "imbridge_operation_timeouts_total";
pub const SESSION_TEARDOWNS: &str = "imbridge_session_teardowns_total";
pub const OPEN_CHANNELS: &str = "imbridge_open_channels";

/// Register metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(MESSAGES_RECEIVED, "Messages delivered to text channels");
    describe_counter!(MESSAGES_SENT, "Send requests issued to the protocol");
    describe_counter!(
        MESSAGES_CONFIRMED,
        "Sends confirmed by the server, labeled by whether the token was still pending"
    );
    describe_counter!(
        AUTH_FAILURES,
        "Rejected authentication attempts, labeled by outcome (retry, terminal)"
    );
    describe_counter!(RECONNECTS, "Reconnection attempts after an unexpected drop");
    describe_counter!(
        OPERATION_TIMEOUTS,
        "Pending operations expired by the sweep, labeled by kind (send, avatar)"
    );
    describe_counter!(
        SESSION_TEARDOWNS,
        "Session scopes torn down, labeled by reason"
    );
    describe_gauge!(OPEN_CHANNELS, "Channels currently open");
}

pub fn record_received(count: usize) {
    counter!(MESSAGES_RECEIVED).increment(count as u64);
}

pub fn record_sent() {
    counter!(MESSAGES_SENT).increment(1);
}

pub fn record_confirmed(was_pending: bool) {
    let pending = if was_pending { "true" } else { "false" };
    counter!(MESSAGES_CONFIRMED, "pending" => pending).increment(1);
}

pub fn record_auth_failure(terminal: bool) {
    let outcome = if terminal { "terminal" } else { "retry" };
    counter!(AUTH_FAILURES, "outcome" => outcome).increment(1);
}

pub fn record_reconnect() {
    counter!(RECONNECTS).increment(1);
}

pub fn record_timeouts(kind: &'static str, count: usize) {
    if count > 0 {
        counter!(OPERATION_TIMEOUTS, "kind" => kind).increment(count as u64);
    }
}

pub fn record_teardown(reason: &'static str) {
    counter!(SESSION_TEARDOWNS, "reason" => reason).increment(1);
}

pub fn record_open_channels(count: usize) {
    gauge!(OPEN_CHANNELS).set(count as f64);
}
