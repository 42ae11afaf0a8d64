//! Error types for the Tiller control plane

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for the Tiller control plane
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A module lifecycle hook failed
    #[error("module '{module}' failed: {message}")]
    Module {
        /// Module name
        module: String,
        /// Error message
        message: String,
    },

    /// A module was compiled against an incompatible host
    #[error("module '{module}' is not binary compatible (built for '{found}', host is '{expected}')")]
    SignatureMismatch {
        /// Module name
        module: String,
        /// Signature the host expects
        expected: String,
        /// Signature the module carries
        found: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Two shared memory zone requests disagree on identity
    #[error("shared zone \"{zone}\" conflict: {message}")]
    ZoneConflict {
        /// Zone name
        zone: String,
        /// Error message
        message: String,
    },

    /// A shared memory zone could not be mapped or initialized
    #[error("shared zone \"{zone}\": {message}")]
    Zone {
        /// Zone name
        zone: String,
        /// Error message
        message: String,
    },

    /// A required listening endpoint could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Signal delivery to the master process failed
    #[error("signal error: {0}")]
    Signal(String),

    /// Re-exec of a new binary failed
    #[error("binary upgrade failed: {0}")]
    Upgrade(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen in production)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a module error
    pub fn module(module: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Module {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create a zone error
    pub fn zone(zone: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Zone {
            zone: zone.into(),
            message: message.into(),
        }
    }

    /// Create a zone identity conflict error
    pub fn zone_conflict(zone: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ZoneConflict {
            zone: zone.into(),
            message: message.into(),
        }
    }

    /// Whether a reload hitting this error keeps the previous cycle active.
    ///
    /// Every build error is recoverable when a previous generation exists;
    /// the distinction matters only for reporting.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Error::Module { .. }
                | Error::Config(_)
                | Error::ZoneConflict { .. }
                | Error::Zone { .. }
                | Error::Bind { .. }
        )
    }
}
