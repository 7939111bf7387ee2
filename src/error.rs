//! Error types for the data-plane installer
//!
//! Errors are structured with fields so a failed run names the resource,
//! path, or kind that stopped it. The taxonomy maps onto how each failure
//! is handled: NotFound is expected while probing, API errors on reads are
//! retried, everything else terminates the run.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for installer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A manifest template could not be located or parsed
    #[error("template error [{template}]: {message}")]
    Template {
        /// Logical template path
        template: String,
        /// Description of what failed
        message: String,
    },

    /// A required manifest path is absent or blank
    #[error("required path '{path}' missing in {resource}")]
    MissingPath {
        /// Dotted path that was read
        path: String,
        /// Resource being read (kind/name when known)
        resource: String,
    },

    /// A path expression could not be parsed
    #[error("invalid path '{path}': {message}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// Description of the syntax problem
        message: String,
    },

    /// A manifest carries a kind the installer has no handling for
    #[error("unsupported resource kind '{kind}'")]
    UnsupportedKind {
        /// The kind string found in the manifest
        kind: String,
    },

    /// Configuration is incomplete or inconsistent
    #[error("configuration error at {field}: {message}")]
    Configuration {
        /// Configuration field (e.g. "s3.bucket")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A readiness wait exceeded its deadline
    #[error("timed out after {elapsed:?} waiting for {resource}")]
    Timeout {
        /// Resource being waited on (kind/namespace/name)
        resource: String,
        /// How long the wait ran
        elapsed: Duration,
    },

    /// The run was cancelled while an operation was in flight
    #[error("cancelled during {operation}")]
    Cancelled {
        /// Operation that observed the cancellation
        operation: String,
    },

    /// The provisioning task graph is malformed
    #[error("task graph error: {message}")]
    Graph {
        /// Description of the defect (unknown predecessor, cycle, ...)
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a template error for a logical template path
    pub fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-path error naming the resource that was read
    pub fn missing_path(path: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::MissingPath {
            path: path.into(),
            resource: resource.into(),
        }
    }

    /// Create an invalid-path error
    pub fn invalid_path(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an unsupported-kind error
    pub fn unsupported_kind(kind: impl Into<String>) -> Self {
        Self::UnsupportedKind { kind: kind.into() }
    }

    /// Create a configuration error for a field
    pub fn configuration(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(resource: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            resource: resource.into(),
            elapsed,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a task graph error
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the API reported the addressed object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Check if this error is retryable
    ///
    /// NotFound cannot change by retrying. Configuration, template and
    /// kind errors indicate a packaging defect. Cancellation must never be
    /// swallowed by a retry loop.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => !self.is_not_found(),
            Error::Timeout { .. } | Error::Internal { .. } => true,
            Error::Template { .. }
            | Error::MissingPath { .. }
            | Error::InvalidPath { .. }
            | Error::UnsupportedKind { .. }
            | Error::Configuration { .. }
            | Error::Serialization { .. }
            | Error::Cancelled { .. }
            | Error::Graph { .. } => false,
        }
    }

    /// Whether this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Build a kube API error with the given HTTP status code.
///
/// Used by fakes and mocks to produce errors indistinguishable from the
/// ones the real client returns.
#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} ({})", reason, code),
            reason: reason.to_string(),
            code,
        }),
    }
}
