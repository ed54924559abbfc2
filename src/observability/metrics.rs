//! Metrics collection.
//!
//! # Metrics
//! - `transport_connections_active` (gauge): currently open connections
//! - `transport_connections_opened_total` (counter): by direction
//! - `transport_connections_closed_total` (counter): by close reason
//! - `transport_dial_failures_total` (counter): by error kind
//!
//! # Design Decisions
//! - Uses the `metrics` facade; the host process installs the recorder
//! - Low-overhead updates (atomic operations in the recorder)

use metrics::{counter, gauge};

/// Record a newly adapted connection.
pub fn record_connection_opened(direction: &'static str) {
    counter!("transport_connections_opened_total", "direction" => direction).increment(1);
    gauge!("transport_connections_active").increment(1.0);
}

/// Record a terminated connection and why it closed.
pub fn record_connection_closed(reason: &'static str) {
    counter!("transport_connections_closed_total", "reason" => reason).increment(1);
    gauge!("transport_connections_active").decrement(1.0);
}

/// Record a dial attempt that did not produce a connection.
pub fn record_dial_failure(kind: &'static str) {
    counter!("transport_dial_failures_total", "kind" => kind).increment(1);
}
