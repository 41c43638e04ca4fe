use thiserror::Error;

/// Failures reported by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transport or server-side failure; retry with backoff.
    #[error("connection: {0}")]
    Connection(String),
    /// The watch cursor is no longer served; a full relist is required.
    #[error("resource version expired: {0}")]
    Expired(String),
    /// The response could not be decoded; the current attempt is lost.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The store refuses the request (authn/authz, unknown resource). Not retryable.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Rejected(_))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, StoreError::Expired(_))
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            StoreError::Connection(_) => "connection",
            StoreError::Expired(_) => "expired",
            StoreError::Malformed(_) => "malformed",
            StoreError::Rejected(_) => "rejected",
        }
    }
}

/// Invalid filter or configuration, detected before anything is started.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("filter: kind must not be empty")]
    EmptyKind,
    #[error("filter: invalid namespace {0:?} (expect a DNS-1123 label)")]
    InvalidNamespace(String),
    #[error("config: {0}")]
    Invalid(String),
}
