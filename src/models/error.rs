//! Error types for lodectl.
//!
//! Taxonomy:
//! - Fatal: the store, importer or coordinator cannot be reached, or the
//!   operator passed something malformed. These abort the current command.
//! - Idempotent no-ops: nothing matched the request. Callers treat these as
//!   success so that recovery commands can be re-run.
//! - Per-item: one node or one engine failed. Logged with context and
//!   aggregated; the last one is reported after all items were processed.

use thiserror::Error;

/// Top-level error type for lodectl.
#[derive(Debug, Error)]
pub enum LodeError {
    // ═══════════════════════════════════════════════════════════════════
    // FATAL: abort the command
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Backend unavailable: {what}")]
    BackendUnavailable {
        what: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid engine transition for {engine}: {from} -> {to}")]
    InvalidTransition {
        engine: String,
        from: crate::backend::EngineState,
        to: crate::backend::EngineState,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════════════════════════════
    // NO-OP: nothing to act on
    // ═══════════════════════════════════════════════════════════════════

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No table with a recorded error matches {0}")]
    NoErrorRecorded(String),

    // ═══════════════════════════════════════════════════════════════════
    // PER-ITEM: isolated to one node or engine
    // ═══════════════════════════════════════════════════════════════════

    #[error("Store {address} failed: {source}")]
    PerNodeFailure {
        address: String,
        #[source]
        source: Box<LodeError>,
    },

    #[error("Engine {engine} failed: {source}")]
    PerEngineFailure {
        engine: String,
        #[source]
        source: Box<LodeError>,
    },

    // ═══════════════════════════════════════════════════════════════════
    // TRANSPORT: wrapped causes
    // ═══════════════════════════════════════════════════════════════════

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Remote error (status {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LodeError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a backend-unavailable error wrapping its cause.
    pub fn unavailable(
        what: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendUnavailable {
            what: what.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap an error as the failure of one fleet node.
    pub fn per_node(address: impl Into<String>, source: LodeError) -> Self {
        Self::PerNodeFailure {
            address: address.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an error as the failure of one engine.
    pub fn per_engine(engine: impl Into<String>, source: LodeError) -> Self {
        Self::PerEngineFailure {
            engine: engine.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error only says "there was nothing to act on".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NoErrorRecorded(_))
    }
}

/// Result type alias for lodectl.
pub type Result<T> = std::result::Result<T, LodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds_are_noops() {
        assert!(LodeError::NoErrorRecorded("all".into()).is_not_found());
        assert!(LodeError::NotFound("x".into()).is_not_found());
        assert!(!LodeError::Cancelled.is_not_found());
    }

    #[test]
    fn test_per_node_keeps_cause_chain() {
        let err = LodeError::per_node(
            "10.0.0.1:20160",
            LodeError::Remote {
                status: 503,
                message: "busy".into(),
            },
        );
        assert!(err.to_string().contains("10.0.0.1:20160"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("503"));
    }
}
