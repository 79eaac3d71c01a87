//! Error taxonomy for xsink pipeline operations.
//!
//! Each variant marks a distinct failure domain so callers can decide
//! between fatal and tolerated outcomes: coercion failures are per-cell and
//! non-fatal, resolution failures are only fatal when an external schema was
//! explicitly required, everything else aborts the run.

/// Structured error for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum XsinkError {
    /// The input file could not be read, or the XML is malformed.
    #[error("input error: {0}")]
    Input(String),

    /// Schema inference could not identify a document root, or a required
    /// schema source was unavailable.
    #[error("schema error: {0}")]
    Schema(String),

    /// External schema download or parse failed.
    #[error("schema resolution failed: {0}")]
    Resolution(String),

    /// A value could not be converted to its declared type. Per-cell and
    /// non-fatal; sinks log, drop or stringify.
    #[error("coercion failed: {0}")]
    Coercion(String),

    /// The target exists and the write mode is `fail_if_exists`.
    #[error("target conflict: {0}")]
    Conflict(String),

    /// Connection, authentication, or batch-insert failure. Fatal.
    #[error("sink failure: {0}")]
    Sink(String),

    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic error wrapper for context propagation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
