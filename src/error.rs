//! Error types for the controller

use thiserror::Error;

use crate::cloudprovider::CloudProviderError;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cloud API error surfaced by a provider adapter
    #[error("cloud provider error: {0}")]
    CloudProvider(#[from] CloudProviderError),

    /// The object's spec (or name) does not satisfy the controller's requirements
    #[error("validation error: {0}")]
    Validation(String),

    /// Controller configuration error (flags, environment, credentials)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Returns true if the error is an optimistic-concurrency conflict (HTTP 409)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Returns true if the error is a not-found response (HTTP 404)
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "test".to_string(),
            code,
        })
    }

    #[test]
    fn conflict_is_detected_by_status_code() {
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(500)));
        assert!(!is_conflict(&api_error(404)));
    }

    #[test]
    fn not_found_is_detected_by_status_code() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
    }

    #[test]
    fn kube_errors_convert_into_crate_error() {
        let err: Error = api_error(500).into();
        assert!(err.to_string().contains("kubernetes error"));
    }
}
