//! Error types for IAM role to service account mapping

use thiserror::Error;

/// Main error type for trust-policy reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No workload matched the requested execution and user
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller credentials were missing or rejected by the identity oracle
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but lacks the rights for the operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Request payload is missing required fields
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cloud IAM API error
    #[error("iam error: {0}")]
    Iam(String),

    /// Identity oracle error
    #[error("identity oracle error: {0}")]
    Oracle(String),

    /// Trust policy document does not have the expected shape
    #[error("malformed trust policy for role {role}: {message}")]
    MalformedPolicy {
        /// Role whose trust policy was rejected
        role: String,
        /// What was missing or unexpected
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// In-pod agent failed to read its inputs or fetch its profiles
    #[error("agent error: {0}")]
    Agent(String),
}

impl Error {
    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unauthorized error with the given message
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a forbidden error with the given message
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create an invalid request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an IAM error with the given message
    pub fn iam(msg: impl Into<String>) -> Self {
        Self::Iam(msg.into())
    }

    /// Create an identity oracle error with the given message
    pub fn oracle(msg: impl Into<String>) -> Self {
        Self::Oracle(msg.into())
    }

    /// Create a malformed policy error for a role
    pub fn malformed_policy(role: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedPolicy {
            role: role.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an agent error with the given message
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
