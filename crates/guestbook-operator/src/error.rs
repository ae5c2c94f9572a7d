//! Error types for the Guestbook Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Concurrent modification of the status subresource
    #[error("Status update conflict for {name}: {message}")]
    StatusConflict { name: String, message: String },

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::StatusConflict { .. }
                | OperatorError::Timeout(_)
                | OperatorError::ReconcileFailed(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }

    /// Whether this is a rejected creation because the resource already
    /// exists (a concurrent creator won the race)
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(kube::Error::Api(resp))
                if resp.code == 409 && resp.reason == "AlreadyExists"
        )
    }
}

/// Check whether a raw API error is an optimistic-concurrency conflict
pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "Conflict")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} ({})", reason, code),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_error_display() {
        let err = OperatorError::StatusConflict {
            name: "my-app".to_string(),
            message: "object has been modified".to_string(),
        };
        assert!(err.to_string().contains("my-app"));
        assert!(err.to_string().contains("modified"));
    }

    #[test]
    fn test_retryable_errors() {
        let timeout_err = OperatorError::Timeout("test".to_string());
        assert!(timeout_err.is_retryable());

        let config_err = OperatorError::InvalidConfig("test".to_string());
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        let retryable = OperatorError::Timeout("test".to_string());
        assert!(retryable.requeue_delay().is_some());

        let not_retryable = OperatorError::InvalidConfig("test".to_string());
        assert!(not_retryable.requeue_delay().is_none());
    }

    #[test]
    fn test_already_exists_classification() {
        let exists = OperatorError::KubeError(api_error(409, "AlreadyExists"));
        assert!(exists.is_already_exists());

        let conflict = OperatorError::KubeError(api_error(409, "Conflict"));
        assert!(!conflict.is_already_exists());

        let not_found = OperatorError::KubeError(api_error(404, "NotFound"));
        assert!(!not_found.is_already_exists());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(is_conflict(&api_error(409, "Conflict")));
        assert!(!is_conflict(&api_error(409, "AlreadyExists")));
        assert!(!is_conflict(&api_error(500, "InternalError")));
    }
}
