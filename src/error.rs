use resilience::{Classify, FailureKind, RemoteError};
use std::time::Duration;
use telemetry::FailureClass;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failure of a logical call made through the gateway.
///
/// Each layer annotates rather than swallows: remote failures carry the
/// attempt count, breaker rejections carry the remaining cool-down.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network error or timeout that survived every retry.
    #[error("transient remote failure after {attempts} attempt(s): {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// The remote answered and refused the request.
    #[error("remote rejected the request: {source}")]
    Rejected {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// The remote answered with something that could not be interpreted.
    #[error("malformed response after {attempts} attempt(s): {message}")]
    MalformedResponse { attempts: u32, message: String },

    /// The operation's circuit is open; no call was made.
    #[error("circuit open for `{operation}`, retry in {}ms", .retry_after.as_millis())]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    /// The per-call deadline ran out during breaker and retry handling.
    #[error("deadline of {}ms exceeded after {attempts} attempt(s)", .deadline.as_millis())]
    DeadlineExceeded { deadline: Duration, attempts: u32 },

    /// A batch hit its fail-fast threshold before this item started.
    #[error("batch aborted before this item started")]
    BatchAborted,

    /// The caller cancelled before this call started.
    #[error("cancelled")]
    Cancelled,

    /// The request could not be issued at all.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Wrap the last failure of a retried call.
    pub fn from_remote(error: RemoteError, attempts: u32) -> Self {
        match error.kind {
            FailureKind::Network | FailureKind::Timeout => GatewayError::Transient {
                attempts,
                source: error,
            },
            FailureKind::Rejected => GatewayError::Rejected {
                attempts,
                source: error,
            },
            FailureKind::MalformedResponse => GatewayError::MalformedResponse {
                attempts,
                message: error.message,
            },
        }
    }

    pub(crate) fn malformed(message: impl Into<String>, attempts: u32) -> Self {
        GatewayError::MalformedResponse {
            attempts,
            message: message.into(),
        }
    }

    /// Taxonomy class reported to metrics.
    pub fn class(&self) -> FailureClass {
        match self {
            GatewayError::Transient { .. } => FailureClass::TransientRemoteError,
            GatewayError::Rejected { .. } => FailureClass::RemoteRejected,
            GatewayError::MalformedResponse { .. } => FailureClass::MalformedResponse,
            GatewayError::CircuitOpen { .. } => FailureClass::CircuitOpen,
            GatewayError::DeadlineExceeded { .. } => FailureClass::DeadlineExceeded,
            GatewayError::BatchAborted => FailureClass::BatchAborted,
            GatewayError::Cancelled => FailureClass::Cancelled,
            GatewayError::InvalidRequest(_) => FailureClass::InvalidRequest,
        }
    }

    /// Remote attempts made before giving up. Zero when the remote was never called.
    pub fn attempts(&self) -> u32 {
        match self {
            GatewayError::Transient { attempts, .. }
            | GatewayError::Rejected { attempts, .. }
            | GatewayError::MalformedResponse { attempts, .. }
            | GatewayError::DeadlineExceeded { attempts, .. } => *attempts,
            GatewayError::CircuitOpen { .. }
            | GatewayError::BatchAborted
            | GatewayError::Cancelled
            | GatewayError::InvalidRequest(_) => 0,
        }
    }

    /// Whether calling again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient { .. } | GatewayError::DeadlineExceeded { .. }
        )
    }
}

impl Classify for GatewayError {
    fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            GatewayError::Transient { source, .. } | GatewayError::Rejected { source, .. } => {
                Some(source.kind)
            }
            GatewayError::MalformedResponse { .. } => Some(FailureKind::MalformedResponse),
            GatewayError::DeadlineExceeded { .. } => Some(FailureKind::Timeout),
            GatewayError::CircuitOpen { .. }
            | GatewayError::BatchAborted
            | GatewayError::Cancelled
            | GatewayError::InvalidRequest(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failures_map_onto_the_taxonomy() {
        let transient = GatewayError::from_remote(RemoteError::network("reset"), 3);
        assert_eq!(transient.class(), FailureClass::TransientRemoteError);
        assert_eq!(transient.attempts(), 3);
        assert!(transient.is_retryable());

        let rejected = GatewayError::from_remote(RemoteError::rejected("bad folder"), 1);
        assert_eq!(rejected.class(), FailureClass::RemoteRejected);
        assert!(!rejected.is_retryable());

        let malformed = GatewayError::from_remote(RemoteError::malformed("not json"), 1);
        assert_eq!(malformed.class(), FailureClass::MalformedResponse);
    }

    #[test]
    fn only_remote_errors_are_classified_for_the_breaker() {
        let open = GatewayError::CircuitOpen {
            operation: "list-hosts".into(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(open.failure_kind(), None);
        assert_eq!(open.attempts(), 0);
        assert_eq!(GatewayError::Cancelled.failure_kind(), None);
        assert_eq!(
            GatewayError::DeadlineExceeded {
                deadline: Duration::from_secs(1),
                attempts: 2
            }
            .failure_kind(),
            Some(FailureKind::Timeout)
        );
    }

    #[test]
    fn messages_carry_annotations() {
        let err = GatewayError::from_remote(RemoteError::timeout("no answer"), 3);
        assert_eq!(
            err.to_string(),
            "transient remote failure after 3 attempt(s): timeout failure: no answer"
        );
        let open = GatewayError::CircuitOpen {
            operation: "list-hosts".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(open.to_string(), "circuit open for `list-hosts`, retry in 1500ms");
    }
}
