//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All components produce:
//!     → tracing events (structured fields, per-connection ids)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → whatever subscriber/recorder the host process installs
//! ```
//!
//! # Design Decisions
//! - The library never installs a global subscriber or recorder
//! - Connection ids flow through all log events for correlation
//! - A timed-out connection suppresses the duplicate error log that the
//!   teardown path would otherwise emit

pub mod metrics;
