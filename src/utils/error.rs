//! Error types for Stratus

use thiserror::Error;

/// Main error type for Stratus operations
///
/// Every terminal failure a request can reach is one of these variants. The
/// type is `Clone` so the same value can sit in a [`Response`](crate::network::Response)
/// and travel inside an [`Event`](crate::events::Event).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StratusError {
    /// Malformed request, rejected before scheduling
    #[error("malformed request: {0}")]
    Admission(String),
    /// Server certificate rejected by the trust gate
    #[error("certificate for {host} rejected ({fingerprint})")]
    Trust { host: String, fingerprint: String },
    /// Authentication method failed to authorize the request
    #[error("authorization failed: {0}")]
    Authorization(String),
    /// Transport-level failure
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    /// Redirect chain exceeded the allowed depth
    #[error("redirect loop: more than {max_depth} redirects")]
    RedirectLoop { max_depth: u8 },
    /// Request was cancelled
    #[error("request cancelled")]
    Cancelled,
    /// No authentication method registered under the identifier
    #[error("unknown authentication method: {0}")]
    UnknownAuthenticationMethod(String),
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),
    /// Local I/O failure (download destination, config file)
    #[error("I/O error: {0}")]
    Io(String),
    /// Queue no longer accepts requests
    #[error("request queue is shut down")]
    ShutDown,
}

/// Network-specific errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Connection dropped mid-transfer
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Connection timed out
    #[error("timed out")]
    Timeout,
    /// DNS resolution failed
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),
    /// Connection refused
    #[error("connection refused")]
    ConnectionRefused,
    /// TLS/SSL error unrelated to certificate policy
    #[error("TLS error: {0}")]
    Tls(String),
    /// Server did not accept the resume metadata
    #[error("resume rejected: {0}")]
    ResumeRejected(String),
    /// Anything else the transport reports
    #[error("{0}")]
    Other(String),
}

impl NetworkError {
    /// Whether this failure is a loss of connectivity (resume eligible)
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::Timeout | Self::DnsResolution(_) | Self::ConnectionRefused
        )
    }
}

impl StratusError {
    /// Whether this is a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this is a connectivity failure the resume controller may act on
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(e) if e.is_connectivity())
    }
}

impl From<std::io::Error> for StratusError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<url::ParseError> for StratusError {
    fn from(err: url::ParseError) -> Self {
        Self::Admission(format!("invalid URL: {}", err))
    }
}

/// Convenience Result type for Stratus operations
pub type Result<T> = std::result::Result<T, StratusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(StratusError::from(NetworkError::Timeout).is_connectivity());
        assert!(StratusError::from(NetworkError::ConnectionLost("reset".into())).is_connectivity());
        assert!(!StratusError::from(NetworkError::Tls("bad record".into())).is_connectivity());
        assert!(!StratusError::Cancelled.is_connectivity());
        assert!(!StratusError::Authorization("denied".into()).is_connectivity());
    }

    #[test]
    fn test_cancellation_is_distinct() {
        assert!(StratusError::Cancelled.is_cancellation());
        assert!(!StratusError::RedirectLoop { max_depth: 5 }.is_cancellation());
    }

    #[test]
    fn test_display() {
        let err = StratusError::RedirectLoop { max_depth: 5 };
        assert_eq!(err.to_string(), "redirect loop: more than 5 redirects");
    }
}
