use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed call, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientRemoteError,
    RemoteRejected,
    CircuitOpen,
    BatchAborted,
    Cancelled,
    DeadlineExceeded,
    MalformedResponse,
    InvalidRequest,
}

impl FailureClass {
    pub const ALL: [FailureClass; 8] = [
        FailureClass::TransientRemoteError,
        FailureClass::RemoteRejected,
        FailureClass::CircuitOpen,
        FailureClass::BatchAborted,
        FailureClass::Cancelled,
        FailureClass::DeadlineExceeded,
        FailureClass::MalformedResponse,
        FailureClass::InvalidRequest,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::TransientRemoteError => "transient_remote_error",
            FailureClass::RemoteRejected => "remote_rejected",
            FailureClass::CircuitOpen => "circuit_open",
            FailureClass::BatchAborted => "batch_aborted",
            FailureClass::Cancelled => "cancelled",
            FailureClass::DeadlineExceeded => "deadline_exceeded",
            FailureClass::MalformedResponse => "malformed_response",
            FailureClass::InvalidRequest => "invalid_request",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_match_declaration_order() {
        for (i, class) in FailureClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }

    #[test]
    fn serde_name_matches_as_str() {
        for class in FailureClass::ALL {
            let json = serde_json::to_string(&class).unwrap();
            assert_eq!(json, format!("\"{}\"", class.as_str()));
        }
    }
}
