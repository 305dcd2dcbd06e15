//! Classified failures returned by the remote transport.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection refused, reset, DNS failure and similar.
    Network,
    /// The remote did not answer in time.
    Timeout,
    /// The remote answered and refused the request (validation, auth, 4xx).
    Rejected,
    /// The remote answered with something that could not be interpreted.
    MalformedResponse,
}

impl FailureKind {
    /// Whether the failure signals the remote itself is unavailable.
    ///
    /// Only these count toward opening a circuit.
    pub fn indicates_unavailability(self) -> bool {
        matches!(self, FailureKind::Network | FailureKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::Rejected => "rejected",
            FailureKind::MalformedResponse => "malformed_response",
        }
    }
}

/// Failure returned by the underlying remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} failure: {message}", kind.as_str())]
pub struct RemoteError {
    pub kind: FailureKind,
    pub message: String,
    /// HTTP status, when the transport had one.
    pub status: Option<u16>,
}

impl RemoteError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedResponse, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Classify an HTTP status code the way the monitoring API uses them.
    ///
    /// 408, 429 and 5xx mean the remote is struggling; other 4xx are the
    /// caller's fault.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 | 504 => FailureKind::Timeout,
            429 | 500..=599 => FailureKind::Network,
            _ => FailureKind::Rejected,
        };
        Self::new(kind, message).with_status(status)
    }
}

/// A single attempt exceeded its per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimeout {
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Duration,
}

impl From<AttemptTimeout> for RemoteError {
    fn from(value: AttemptTimeout) -> Self {
        RemoteError::timeout(format!(
            "attempt {} timed out after {}ms",
            value.attempt,
            value.timeout.as_millis()
        ))
    }
}

/// Errors that can tell the retry and breaker layers what kind of remote
/// failure they represent.
///
/// `None` means the error did not come from the remote at all (a breaker
/// rejection, a cancelled call); such errors are never retried and never
/// counted against a circuit.
pub trait Classify {
    fn failure_kind(&self) -> Option<FailureKind>;
}

impl Classify for RemoteError {
    fn failure_kind(&self) -> Option<FailureKind> {
        Some(self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(RemoteError::from_status(503, "x").kind, FailureKind::Network);
        assert_eq!(RemoteError::from_status(429, "x").kind, FailureKind::Network);
        assert_eq!(RemoteError::from_status(504, "x").kind, FailureKind::Timeout);
        assert_eq!(RemoteError::from_status(408, "x").kind, FailureKind::Timeout);
        assert_eq!(RemoteError::from_status(400, "x").kind, FailureKind::Rejected);
        assert_eq!(RemoteError::from_status(403, "x").kind, FailureKind::Rejected);
        assert_eq!(RemoteError::from_status(404, "x").status, Some(404));
    }

    #[test]
    fn only_network_and_timeout_indicate_unavailability() {
        assert!(FailureKind::Network.indicates_unavailability());
        assert!(FailureKind::Timeout.indicates_unavailability());
        assert!(!FailureKind::Rejected.indicates_unavailability());
        assert!(!FailureKind::MalformedResponse.indicates_unavailability());
    }

    #[test]
    fn attempt_timeout_becomes_timeout_failure() {
        let err: RemoteError = AttemptTimeout {
            attempt: 2,
            timeout: Duration::from_millis(250),
        }
        .into();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert!(err.to_string().contains("attempt 2 timed out after 250ms"));
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = RemoteError::rejected("host name already exists");
        assert_eq!(err.to_string(), "rejected failure: host name already exists");
    }
}
