//! Error types for the Kuryr controller

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Non-success response from Keystone, Neutron or Octavia
    #[error("OpenStack API error ({status}): {message}")]
    OpenStack { status: u16, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A dependency is not available yet; the event is redelivered later
    #[error("Resource not ready: {0}")]
    ResourceNotReady(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Inconsistent input that retrying with the same state will not fix
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Invalid IP network: {0}")]
    InvalidIpNetwork(#[from] ipnetwork::IpNetworkError),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

impl Error {
    /// Build an OpenStack error from a status code and message
    pub fn openstack(status: u16, message: impl Into<String>) -> Self {
        Error::OpenStack {
            status,
            message: message.into(),
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            Error::OpenStack { status, .. } => Some(*status),
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            Error::HttpError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound(_)) || self.status_code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    pub fn is_bad_request(&self) -> bool {
        self.status_code() == Some(400)
    }

    pub fn is_unprocessable(&self) -> bool {
        self.status_code() == Some(422)
    }

    /// Neutron reports exhausted quotas as 409 (rules) or 403/413 (other
    /// resources); the message is the only reliable discriminator.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Error::OpenStack { status, message } => {
                matches!(status, 403 | 409 | 413) && message.to_lowercase().contains("quota")
            }
            _ => false,
        }
    }

    /// Whether retrying the same pass can be expected to succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::ResourceNotReady(_) | Error::HttpError(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            Error::KubeError(_) => true,
            Error::OpenStack { status, .. } => {
                (*status == 409 && !self.is_quota_exceeded()) || *status >= 500
            }
            _ => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::OpenStack { .. } => "openstack",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) => "serialization",
            Error::ResourceNotReady(_) => "not_ready",
            Error::ResourceNotFound(_) => "not_found",
            Error::IntegrityError(_) => "integrity",
            Error::InvalidIpNetwork(_) => "ip_network",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        match err {
            kube::runtime::finalizer::Error::ApplyFailed(e)
            | kube::runtime::finalizer::Error::CleanupFailed(e) => e,
            kube::runtime::finalizer::Error::AddFinalizer(e)
            | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openstack_classification() {
        let err = Error::openstack(404, "Security group rule abc could not be found.");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());

        let err = Error::openstack(
            409,
            "Security group rule already exists. Rule id is 4b1e7e4c-0d3f-4c55-9a6b-8f0e1f2a3b4c.",
        );
        assert!(err.is_conflict());
        assert!(!err.is_quota_exceeded());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_quota_is_not_retriable() {
        let err = Error::openstack(409, "Quota exceeded for resources: ['security_group_rule'].");
        assert!(err.is_conflict());
        assert!(err.is_quota_exceeded());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_not_ready_is_retriable() {
        assert!(Error::ResourceNotReady("lb pending".into()).is_retriable());
        assert!(!Error::IntegrityError("two subnets".into()).is_retriable());
        assert_eq!(Error::IntegrityError("x".into()).kind(), "integrity");
    }
}
