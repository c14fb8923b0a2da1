//! Error types for the extract library.

use thiserror::Error;

use crate::catalog::CatalogIssue;

/// Boxed error used for causes coming from external collaborators
/// (drivers, key management, sinks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for extract operations.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// A deferred value was resolved but its backing source was never set.
    #[error("Configuration missing: {name} was never set")]
    ConfigurationMissing { name: String },

    /// Configuration is present but invalid (bad YAML values, bad properties, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key-management decrypt failed (bad key, malformed ciphertext, permission denial).
    #[error("Decryption failed with key {key}")]
    DecryptionFailed {
        key: String,
        #[source]
        source: BoxError,
    },

    /// Opening a source connection failed.
    #[error("Connection failed: {context}")]
    ConnectionFailed {
        context: String,
        #[source]
        source: BoxError,
    },

    /// Executing the extract query or reading its rows failed.
    #[error("Query execution failed: {query}")]
    QueryExecutionFailed {
        query: String,
        #[source]
        source: BoxError,
    },

    /// The catalog is malformed. All issues found are reported together.
    #[error("Catalog validation failed: {}", format_issues(.0))]
    CatalogValidation(Vec<CatalogIssue>),

    /// Writing to the target table failed.
    #[error("Write failed for table {table}: {message}")]
    Write { table: String, message: String },

    /// A row carried a field the target schema does not declare and the
    /// write policy does not tolerate unknown fields.
    #[error("Row for table {table} has field '{field}' not present in the schema")]
    UnknownField { table: String, field: String },

    /// A stage of the execution graph failed; wraps the originating error.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<ExtractError>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable classification of [`ExtractError`] used in reports and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigurationMissing,
    Config,
    DecryptionFailed,
    ConnectionFailed,
    QueryExecutionFailed,
    CatalogValidation,
    Write,
    UnknownField,
    Io,
    Serialization,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationMissing => "configuration_missing",
            ErrorKind::Config => "config",
            ErrorKind::DecryptionFailed => "decryption_failed",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::QueryExecutionFailed => "query_execution_failed",
            ErrorKind::CatalogValidation => "catalog_validation",
            ErrorKind::Write => "write",
            ErrorKind::UnknownField => "unknown_field",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExtractError {
    /// Create a ConfigurationMissing error for the named value.
    pub fn missing(name: impl Into<String>) -> Self {
        ExtractError::ConfigurationMissing { name: name.into() }
    }

    /// Create a ConnectionFailed error with context about where it occurred.
    pub fn connection(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ExtractError::ConnectionFailed {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Create a QueryExecutionFailed error for the given query.
    pub fn query(query: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ExtractError::QueryExecutionFailed {
            query: query.into(),
            source: source.into(),
        }
    }

    /// Create a Write error.
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        ExtractError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Wrap this error as the failure of the named stage.
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        ExtractError::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Classify the error. Stage wrappers report the kind of the originating error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::ConfigurationMissing { .. } => ErrorKind::ConfigurationMissing,
            ExtractError::Config(_) => ErrorKind::Config,
            ExtractError::DecryptionFailed { .. } => ErrorKind::DecryptionFailed,
            ExtractError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            ExtractError::QueryExecutionFailed { .. } => ErrorKind::QueryExecutionFailed,
            ExtractError::CatalogValidation(_) => ErrorKind::CatalogValidation,
            ExtractError::Write { .. } => ErrorKind::Write,
            ExtractError::UnknownField { .. } => ErrorKind::UnknownField,
            ExtractError::Stage { source, .. } => source.kind(),
            ExtractError::Io(_) => ErrorKind::Io,
            ExtractError::Yaml(_) | ExtractError::Json(_) => ErrorKind::Serialization,
            ExtractError::Cancelled => ErrorKind::Cancelled,
            ExtractError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether an outer retry policy may reasonably retry the failed work.
    ///
    /// The library itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionFailed | ErrorKind::QueryExecutionFailed | ErrorKind::Write
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::ConfigurationMissing
            | ErrorKind::Config
            | ErrorKind::CatalogValidation
            | ErrorKind::Serialization => 2,
            ErrorKind::DecryptionFailed => 3,
            ErrorKind::ConnectionFailed
            | ErrorKind::QueryExecutionFailed
            | ErrorKind::Write
            | ErrorKind::UnknownField => 4,
            ErrorKind::Cancelled => 130,
            ErrorKind::Io | ErrorKind::Internal => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error [{}]: {}\n", self.kind(), self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

fn format_issues(issues: &[CatalogIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for extract operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_keeps_originating_kind() {
        let err = ExtractError::DecryptionFailed {
            key: "projects/p/locations/l/keyRings/r/cryptoKeys/k".into(),
            source: "permission denied".into(),
        }
        .in_stage("users");

        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
        assert!(!err.is_retryable());
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        let err = ExtractError::connection("opening source", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(err.kind().as_str(), "connection_failed");
    }

    #[test]
    fn test_format_detailed_walks_cause_chain() {
        let err = ExtractError::query("SELECT 1", "relation does not exist").in_stage("t_copy");
        let detailed = err.format_detailed();

        assert!(detailed.starts_with("Error [query_execution_failed]"));
        assert!(detailed.contains("Caused by:\n  1: Query execution failed: SELECT 1"));
        assert!(detailed.contains("2: relation does not exist"));
    }
}
