//! Transport error taxonomy.
//!
//! # Responsibilities
//! - Distinguish timeouts from caller-initiated aborts and socket faults
//! - Annotate socket faults with the target address for diagnostics
//! - Encode retry policy so callers can branch on the error kind
//!
//! # Design Decisions
//! - Timeouts are retryable; aborts signal caller intent and are not
//! - Bind failures are fatal to the `listen()` call only

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An operation did not complete within its deadline: a dial attempt,
    /// a graceful close, or the per-connection inactivity watchdog.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A caller-supplied cancellation signal fired before the operation
    /// completed. Not a network fault.
    #[error("operation aborted")]
    Aborted,

    /// Any other socket-level fault (refused, reset, resolution failure).
    #[error("connection error {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The listener failed to bind its server socket.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Build a `Connection` error annotated with the peer address.
    pub fn connection(address: impl Into<String>, source: io::Error) -> Self {
        TransportError::Connection {
            address: address.into(),
            source,
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Timeouts and socket faults are transient; an abort was requested by
    /// the caller and a bind failure will recur until the address changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connection { .. }
        )
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Aborted => "aborted",
            TransportError::Connection { .. } => "connection",
            TransportError::Bind { .. } => "bind",
        }
    }
}
