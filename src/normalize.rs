use tracing::{error, info, warn};

use crate::error::{BackendFailure, ConnectionOutcome, ErrorKind, JoinError};
use crate::orchestrator::Resolution;
use crate::request::TargetKey;

/// Map a backend failure signal onto the stable taxonomy.
///
/// `None` means the signal counts as success: joining a network the device
/// is already associated with is not a failure.
pub fn classify(failure: &BackendFailure) -> Option<ErrorKind> {
    match failure {
        BackendFailure::AlreadyAssociated => None,
        BackendFailure::UserDenied => Some(ErrorKind::UserDenied),
        BackendFailure::Pending => Some(ErrorKind::AlreadyInProgress),
        BackendFailure::Unsupported(_) => Some(ErrorKind::Unsupported),
        BackendFailure::Native { .. } => Some(ErrorKind::BackendError),
    }
}

/// Normalize a raw backend report into an outcome.
pub fn normalize_report(key: &TargetKey, report: Result<(), BackendFailure>) -> ConnectionOutcome {
    let failure = match report {
        Ok(()) => {
            info!(target_key = %key, "joined network");
            return ConnectionOutcome::Joined;
        }
        Err(failure) => failure,
    };

    match classify(&failure) {
        None => {
            info!(target_key = %key, "already associated, treating as joined");
            ConnectionOutcome::Joined
        }
        Some(kind) => {
            match &failure {
                BackendFailure::Native { code, message } => {
                    error!(target_key = %key, "backend error {}: {}", code, message)
                }
                other => warn!(target_key = %key, "join failed: {}", other),
            }
            let message = match failure {
                BackendFailure::Native { message, .. } => message,
                other => other.to_string(),
            };
            ConnectionOutcome::Failed(JoinError::new(kind, message))
        }
    }
}

pub(crate) fn normalize(key: &TargetKey, resolution: Resolution) -> ConnectionOutcome {
    match resolution {
        Resolution::Backend(report) => normalize_report(key, report),
        Resolution::Cancelled => ConnectionOutcome::Failed(JoinError::new(
            ErrorKind::Cancelled,
            format!("join of {key} was cancelled"),
        )),
        Resolution::TimedOut => ConnectionOutcome::Failed(JoinError::new(
            ErrorKind::TimedOut,
            format!("no response for {key} before the deadline"),
        )),
    }
}
