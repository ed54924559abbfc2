//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     transport.rs dial(address)
//!         → raw TCP socket (connect/error/timeout/abort race)
//!         → connection.rs (adapter, lifecycle state machine)
//!         → Connection returned to the caller
//!
//! Inbound:
//!     transport.rs listen(node)
//!         → listener.rs (accept loop, connection limits)
//!         → connection.rs (adapter, direction = inbound)
//!         → Connection surfaced via the connection:open event
//!
//! Connection states:
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - One adapter for both directions; only `direction` differs
//! - Termination sources (timeout, error, FIN, close, abort) converge on
//!   a single idempotent transition
//! - The listener's lifecycle is independent of its accepted connections

pub mod connection;
pub mod listener;
pub mod transport;
