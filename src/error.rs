use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Stable failure taxonomy delivered to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Validation failed before dispatch
    InvalidArguments,
    /// Mode or feature not available on this backend
    Unsupported,
    /// The user rejected the join or permission prompt
    UserDenied,
    /// Another request for the same target is still pending
    AlreadyInProgress,
    /// No backend response within the deadline
    TimedOut,
    /// The caller cancelled before the backend resolved
    Cancelled,
    /// Unrecognized backend failure; message is diagnostic only
    BackendError,
}

impl ErrorKind {
    /// Wire code used by the method-call bridge
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArguments => "invalidArguments",
            Self::Unsupported => "unsupported",
            Self::UserDenied => "userDenied",
            Self::AlreadyInProgress => "alreadyInProgress",
            Self::TimedOut => "timedOut",
            Self::Cancelled => "cancelled",
            Self::BackendError => "backendError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A normalized join failure: one [`ErrorKind`] plus a human-readable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct JoinError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JoinError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArguments, message)
    }
}

/// Result of a single connection request. Exactly one is produced per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Joined,
    Failed(JoinError),
}

impl ConnectionOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined)
    }

    /// The failure kind, if any
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Joined => None,
            Self::Failed(err) => Some(err.kind),
        }
    }
}

impl From<JoinError> for ConnectionOutcome {
    fn from(err: JoinError) -> Self {
        Self::Failed(err)
    }
}

/// Native failure signals reported by a backend, before normalization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    #[error("already associated with the requested network")]
    AlreadyAssociated,

    #[error("user denied the connection")]
    UserDenied,

    #[error("a join for this network is already pending")]
    Pending,

    #[error("not supported: {0}")]
    Unsupported(String),

    /// Anything else; `code` is the backend's own identifier for the failure
    #[error("backend error {code}: {message}")]
    Native { code: String, message: String },
}

impl BackendFailure {
    pub fn native(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Native {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while setting up a backend or host
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConnectResult<T> = Result<T, ConnectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_camel_case() {
        assert_eq!(ErrorKind::InvalidArguments.code(), "invalidArguments");
        assert_eq!(ErrorKind::AlreadyInProgress.code(), "alreadyInProgress");
        assert_eq!(
            serde_json::to_string(&ErrorKind::UserDenied).unwrap(),
            "\"userDenied\""
        );
    }

    #[test]
    fn test_join_error_display() {
        let err = JoinError::new(ErrorKind::TimedOut, "no answer after 30s");
        assert_eq!(err.to_string(), "timedOut: no answer after 30s");
    }

    #[test]
    fn test_outcome_error_kind() {
        assert_eq!(ConnectionOutcome::Joined.error_kind(), None);
        let failed: ConnectionOutcome = JoinError::invalid_arguments("empty ssid").into();
        assert_eq!(failed.error_kind(), Some(ErrorKind::InvalidArguments));
        assert!(!failed.is_joined());
    }
}
