//! Single-flight Wi-Fi join orchestration.
//!
//! Callers submit [`ConnectionRequest`]s to an [`Orchestrator`], which
//! validates them, keeps at most one join in flight per target, hands them
//! to a [`WifiBackend`] and delivers exactly one [`ConnectionOutcome`] for
//! each.

pub mod backend;
pub mod bridge;
pub mod error;
pub mod normalize;
pub mod orchestrator;
pub mod request;

pub use backend::{SavedNetworkRef, WifiBackend};
pub use error::{ConnectionOutcome, ErrorKind, JoinError};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use request::{ConnectionRequest, TargetKey};
