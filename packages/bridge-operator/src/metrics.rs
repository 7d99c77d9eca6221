//! Prometheus metrics for the WEL/ETH bridge
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter_vec, Gauge, GaugeVec, IntCounterVec,
};

lazy_static! {
    // Flow metrics
    pub static ref FLOWS_STARTED: IntCounterVec = register_int_counter_vec!(
        "weleth_flows_started_total",
        "Total number of flows started",
        &["flow"]
    ).expect("constant metric name is valid");

    pub static ref FLOWS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "weleth_flows_finished_total",
        "Total number of flows finished",
        &["flow", "status"]
    ).expect("constant metric name is valid");

    pub static ref ACTIVITY_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "weleth_activity_attempts_total",
        "Total number of activity attempts",
        &["activity", "outcome"]
    ).expect("constant metric name is valid");

    // Claim metrics
    pub static ref CLAIM_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "weleth_claim_requests_total",
        "Claim requests by outcome",
        &["direction", "outcome"]
    ).expect("constant metric name is valid");

    pub static ref STALE_PENDING_REQUESTS: Gauge = register_gauge!(
        "weleth_claim_requests_stale_expired",
        "Pending claim requests expired by the last sweep"
    ).expect("constant metric name is valid");

    pub static ref PENDING_REQUESTS: Gauge = register_gauge!(
        "weleth_claim_requests_pending",
        "Claim requests currently pending"
    ).expect("constant metric name is valid");

    // Chain metrics
    pub static ref BROADCASTS: IntCounterVec = register_int_counter_vec!(
        "weleth_broadcasts_total",
        "Transactions broadcast",
        &["chain", "outcome"]
    ).expect("constant metric name is valid");

    pub static ref QUEUE_IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "weleth_queue_in_flight",
        "Flows currently executing per task queue",
        &["queue"]
    ).expect("constant metric name is valid");

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "weleth_up",
        "Whether the bridge service is up and running"
    ).expect("constant metric name is valid");
}

/// Record a flow start
pub fn record_flow_started(flow: &str) {
    FLOWS_STARTED.with_label_values(&[flow]).inc();
}

/// Record a flow reaching a final status
pub fn record_flow_finished(flow: &str, status: &str) {
    FLOWS_FINISHED.with_label_values(&[flow, status]).inc();
}

pub fn record_activity_attempt(activity: &str, outcome: &str) {
    ACTIVITY_ATTEMPTS.with_label_values(&[activity, outcome]).inc();
}

pub fn record_claim_request(direction: &str, outcome: &str) {
    CLAIM_REQUESTS.with_label_values(&[direction, outcome]).inc();
}

/// Record a broadcast result: `accepted` or the error kind
pub fn record_broadcast(chain: &str, outcome: &str) {
    BROADCASTS.with_label_values(&[chain, outcome]).inc();
}

pub fn set_stale_expired(count: u64) {
    STALE_PENDING_REQUESTS.set(count as f64);
}

pub fn set_pending_requests(count: i64) {
    PENDING_REQUESTS.set(count as f64);
}

pub fn set_queue_in_flight(queue: &str, count: usize) {
    QUEUE_IN_FLIGHT.with_label_values(&[queue]).set(count as f64);
}
