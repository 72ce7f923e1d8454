//! Metrics for sync observability
//!
//! Thin facade over the `metrics` crate. Counters cover the inbound
//! gate (sent/received/dropped), merge outcomes, and presence churn; a
//! gauge tracks the live peer count. Exporters are wired by the host
//! application, not here.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions for every metric this crate emits.
pub fn init_metrics() {
    describe_counter!("sync.messages.sent", "Messages handed to a transport");
    describe_counter!("sync.messages.received", "Messages accepted by the inbound gate");
    describe_counter!("sync.messages.dropped.auth", "Messages dropped for auth token mismatch");
    describe_counter!("sync.messages.dropped.format", "Messages dropped as malformed");
    describe_counter!("sync.messages.dropped.loopback", "Self-originated messages discarded");
    describe_counter!("sync.messages.dropped.link", "Messages dropped while the link was down");

    describe_counter!("sync.orders.created", "Orders created locally");
    describe_counter!("sync.orders.merged", "Remote orders merged into the log");
    describe_counter!("sync.orders.duplicates", "Duplicate order arrivals absorbed");
    describe_counter!("sync.orders.orphan_updates", "Order updates dropped for unknown ids");
    describe_counter!("sync.backfill.orders", "Orders re-broadcast during join backfill");

    describe_counter!("presence.peers.joined", "Peer join events");
    describe_counter!("presence.peers.left", "Peer leave events");
    describe_gauge!("presence.peers.active", "Peers currently in the registry");
}

/// Record a counter metric.
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric.
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_calls_do_not_panic_without_recorder() {
        // The metrics crate no-ops when no recorder is installed.
        init_metrics();
        record_counter("sync.messages.sent", 1);
        record_gauge("presence.peers.active", 2.0);
    }
}
