//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Catch configurations that would never close a connection gracefully
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: PeerwireConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::PeerwireConfig;

/// A single semantic validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every error found.
pub fn validate_config(config: &PeerwireConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let transport = &config.transport;

    if config.node.id.is_empty() {
        errors.push(ValidationError {
            field: "node.id".into(),
            message: "node id must not be empty".into(),
        });
    }

    if transport.inactivity_timeout_ms == 0 {
        errors.push(ValidationError {
            field: "transport.inactivity_timeout_ms".into(),
            message: "must be greater than zero".into(),
        });
    }

    if transport.close_timeout_ms == 0 {
        errors.push(ValidationError {
            field: "transport.close_timeout_ms".into(),
            message: "must be greater than zero".into(),
        });
    }

    if transport.connect_timeout_ms == 0 {
        errors.push(ValidationError {
            field: "transport.connect_timeout_ms".into(),
            message: "must be greater than zero".into(),
        });
    }

    if transport.max_connections == 0 {
        errors.push(ValidationError {
            field: "transport.max_connections".into(),
            message: "listener would pause immediately; must be at least 1".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
