//! Error types for the EMQX operator
//!
//! Errors fall into two classes. Transient ("common") errors stop the
//! current reconcile pass and requeue after a short fixed delay. Everything
//! else is surfaced to kube-runtime, which applies its own backoff.

use thiserror::Error;

use crate::controller::port_forward::PortForwardError;

/// Result type alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("EMQX API {operation} returned HTTP {status}: {body}")]
    AdminApiError {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Port forward error: {0}")]
    PortForwardError(#[from] PortForwardError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Dependent object not ready: {0}")]
    NotReady(String),

    #[error("Invalid address {0:?}: neither an IPv4 nor an IPv6 literal")]
    InvalidAddress(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with the name of the operation that produced it
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context wrappers stripped
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a transient ("common") error.
    ///
    /// Transient errors cover objects that do not exist yet, write conflicts,
    /// throttling, server-side failures and an unreachable EMQX API.
    pub fn is_retriable(&self) -> bool {
        match self.root() {
            Error::KubeError(kube::Error::Api(e)) => {
                e.code == 404 || e.code == 409 || e.code == 429 || e.code >= 500
            }
            Error::KubeError(kube::Error::Service(_))
            | Error::KubeError(kube::Error::HyperError(_)) => true,
            Error::KubeError(_) => false,
            Error::HttpError(_)
            | Error::AdminApiError { .. }
            | Error::PortForwardError(_)
            | Error::NotReady(_) => true,
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::InvalidAddress(_) => false,
            Error::Context { .. } => false,
        }
    }

    /// Whether the root cause is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// Short, stable label for metrics
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) | Error::AdminApiError { .. } => "admin_api",
            Error::PortForwardError(_) => "port_forward",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::NotReady(_) => "not_ready",
            Error::InvalidAddress(_) => "invalid_address",
            Error::Context { .. } => "unknown",
        }
    }
}

/// Attach an operation name to the error side of a `Result`
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_not_found_and_conflict_are_retriable() {
        assert!(api_error(404).is_retriable());
        assert!(api_error(409).is_retriable());
        assert!(api_error(503).is_retriable());
        assert!(!api_error(422).is_retriable());
    }

    #[test]
    fn test_context_preserves_classification() {
        let err = api_error(404)
            .context("get StatefulSet emqx-core")
            .context("status");
        assert!(err.is_retriable());
        assert!(err.is_not_found());
        assert_eq!(err.kind(), "kube");
    }

    #[test]
    fn test_context_display_shows_full_chain() {
        let err = Error::ValidationError("image must not be empty".to_string())
            .context("validate spec")
            .context("reconcile default/emqx");
        assert_eq!(
            err.to_string(),
            "reconcile default/emqx: validate spec: Validation error: image must not be empty"
        );
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_admin_api_errors_are_transient() {
        let err = Error::AdminApiError {
            operation: "GET /nodes".to_string(),
            status: 503,
            body: String::new(),
        };
        assert!(err.is_retriable());
        assert!(!Error::InvalidAddress("pod-a".to_string()).is_retriable());
    }

    #[test]
    fn test_result_ext_wraps_foreign_errors() {
        let res: std::result::Result<(), serde_json::Error> =
            serde_json::from_str::<()>("nope").map(|_| ());
        let err = res.context("decode nodes").unwrap_err();
        assert!(err.to_string().starts_with("decode nodes: Serialization error"));
        assert_eq!(err.kind(), "serialization");
    }
}
