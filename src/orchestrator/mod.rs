mod delivery;
mod registry;

pub use delivery::{CancelHandle, Completion, PendingConnection};
pub(crate) use delivery::Resolution;
pub use registry::InFlightRegistry;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tracing::{info, warn};

use crate::backend::{SavedNetworkRef, WifiBackend};
use crate::error::{ConnectionOutcome, ErrorKind, JoinError};
use crate::request::{Capabilities, ConnectionRequest, TargetKey};

use delivery::Slot;

/// Which saved networks `disconnect` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetPolicy {
    /// Every saved entry the backend reports
    ForgetAll,
    /// Only entries saved by this instance
    #[default]
    ForgetOwnOnly,
}

impl ForgetPolicy {
    fn covers(&self, network: &SavedNetworkRef) -> bool {
        match self {
            Self::ForgetAll => true,
            Self::ForgetOwnOnly => network.is_own(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound on how long a join may stay pending
    pub timeout: Duration,
    pub forget_policy: ForgetPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            forget_policy: ForgetPolicy::default(),
        }
    }
}

/// Validates join requests, keeps at most one in flight per target, and
/// delivers exactly one outcome for each.
pub struct Orchestrator<B> {
    backend: Arc<B>,
    registry: Arc<InFlightRegistry>,
    config: OrchestratorConfig,
}

impl<B: WifiBackend> Orchestrator<B> {
    pub fn new(backend: B, config: OrchestratorConfig) -> Self {
        Self::with_registry(backend, config, Arc::new(InFlightRegistry::new()))
    }

    /// Share `registry` with other orchestrators so single-flight holds
    /// across all of them.
    pub fn with_registry(
        backend: B,
        config: OrchestratorConfig,
        registry: Arc<InFlightRegistry>,
    ) -> Self {
        Self {
            backend: Arc::new(backend),
            registry,
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Backend deadline when it declares one, never above the configured ceiling
    fn deadline(&self, caps: &Capabilities) -> Duration {
        caps.join_timeout
            .map_or(self.config.timeout, |t| t.min(self.config.timeout))
    }

    /// Validate, register and dispatch a request without waiting for it.
    ///
    /// Fails immediately with `InvalidArguments`/`Unsupported` on a bad
    /// request and with `AlreadyInProgress` when the same target is pending.
    pub fn begin(&self, request: ConnectionRequest) -> Result<PendingConnection, JoinError> {
        let caps = self.backend.capabilities();
        let request = request.validate(&caps).map_err(|e| {
            warn!("rejected join request: {}", e);
            JoinError::from(e)
        })?;
        let key = request.key().clone();

        // Weak: the backend may hold this request's Completion.
        let backend = Arc::downgrade(&self.backend);
        let (slot, receiver) = Slot::new(
            key.clone(),
            Arc::clone(&self.registry),
            Box::new(move |key: &TargetKey| {
                if let Some(backend) = backend.upgrade() {
                    backend.cancel(key);
                }
            }),
        );

        if !self.registry.try_register(&key, &slot) {
            warn!(target_key = %key, "join already in progress");
            return Err(JoinError::new(
                ErrorKind::AlreadyInProgress,
                format!("a join for {key} is already in progress"),
            ));
        }

        info!(
            target_key = %key,
            join_once = request.join_once(),
            "connecting to wifi"
        );
        let pending = PendingConnection::new(Arc::clone(&slot), receiver, self.deadline(&caps));
        self.backend.apply(request, Completion::new(slot));
        Ok(pending)
    }

    /// Run a request to its single outcome.
    pub async fn connect(&self, request: ConnectionRequest) -> ConnectionOutcome {
        match self.begin(request) {
            Ok(pending) => pending.wait().await,
            Err(err) => ConnectionOutcome::Failed(err),
        }
    }

    /// Revoke the pending request for `key`, if any.
    pub fn cancel(&self, key: &TargetKey) -> bool {
        match self.registry.lookup(key) {
            Some(slot) => slot.resolve(Resolution::Cancelled),
            None => false,
        }
    }

    pub async fn connect_open(&self, ssid: &str, save_network: bool) -> ConnectionOutcome {
        self.connect(ConnectionRequest::open(ssid, save_network))
            .await
    }

    pub async fn connect_with_prefix(&self, ssid: &str, save_network: bool) -> ConnectionOutcome {
        self.connect(ConnectionRequest::open_prefix(ssid, save_network))
            .await
    }

    pub async fn secure_connect(
        &self,
        ssid: &str,
        password: &str,
        is_legacy_wep: bool,
        save_network: bool,
    ) -> ConnectionOutcome {
        self.connect(ConnectionRequest::secured(
            ssid,
            password,
            is_legacy_wep,
            save_network,
        ))
        .await
    }

    pub async fn secure_prefix_connect(
        &self,
        ssid: &str,
        password: &str,
        is_legacy_wep: bool,
        save_network: bool,
    ) -> ConnectionOutcome {
        self.connect(ConnectionRequest::secured_prefix(
            ssid,
            password,
            is_legacy_wep,
            save_network,
        ))
        .await
    }

    /// Forget saved networks according to the forget policy.
    ///
    /// Best effort: failures are logged and the result is always `true`.
    pub async fn disconnect(&self) -> bool {
        let saved = match self.backend.list_saved_networks().await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Failed to list saved networks: {}", e);
                return true;
            }
        };

        let policy = self.config.forget_policy;
        let targets: Vec<&SavedNetworkRef> = saved.iter().filter(|n| policy.covers(n)).collect();
        let results = join_all(targets.iter().map(|network| async move {
            (*network, self.backend.forget(network).await)
        }))
        .await;

        for (network, result) in results {
            match result {
                Ok(()) => info!("disconnecting from: {}", network.ssid()),
                Err(e) => warn!("Failed to forget {}: {}", network.ssid(), e),
            }
        }
        true
    }

    pub async fn current_network_name(&self) -> Option<String> {
        self.backend.current_network_name().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Behavior, FakeBackend};
    use crate::error::BackendFailure;

    fn orchestrator(backend: FakeBackend) -> Orchestrator<FakeBackend> {
        Orchestrator::new(backend, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn test_open_join_succeeds() {
        let orch = orchestrator(FakeBackend::new());
        assert_eq!(orch.connect_open("Cafe", false).await, ConnectionOutcome::Joined);
        assert_eq!(orch.backend().apply_count(), 1);
        assert!(orch.registry().is_empty());
        assert_eq!(orch.current_network_name().await.as_deref(), Some("Cafe"));
    }

    #[tokio::test]
    async fn test_empty_passphrase_never_dispatched() {
        let orch = orchestrator(FakeBackend::new());
        let outcome = orch.secure_connect("Home", "", false, true).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::InvalidArguments));
        let outcome = orch.secure_prefix_connect("Home", "", true, true).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::InvalidArguments));
        assert_eq!(orch.backend().apply_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_target_rejected_first_unaffected() {
        let orch = orchestrator(FakeBackend::new().with_behavior(Behavior::Never));
        let first = orch.begin(ConnectionRequest::open("Lab", true)).unwrap();

        let second = orch
            .connect(ConnectionRequest::secured("Lab", "pw123456", false, false))
            .await;
        assert_eq!(second.error_kind(), Some(ErrorKind::AlreadyInProgress));
        assert_eq!(orch.backend().apply_count(), 1);
        assert!(orch.registry().is_pending(first.key()));

        assert_eq!(orch.backend().release_held(Ok(())), 1);
        assert_eq!(first.wait().await, ConnectionOutcome::Joined);
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn test_distinct_targets_run_concurrently() {
        let orch = orchestrator(FakeBackend::new().with_behavior(Behavior::Never));
        let exact = orch.begin(ConnectionRequest::open("Lab", true)).unwrap();
        let prefix = orch.begin(ConnectionRequest::open_prefix("Lab", true)).unwrap();
        let other = orch.begin(ConnectionRequest::open("Office", true)).unwrap();
        assert_eq!(orch.registry().len(), 3);

        orch.backend().release_held(Ok(()));
        for pending in [exact, prefix, other] {
            assert!(pending.wait().await.is_joined());
        }
    }

    #[tokio::test]
    async fn test_already_associated_is_joined() {
        let backend = FakeBackend::new()
            .with_behavior(Behavior::Fail(BackendFailure::AlreadyAssociated));
        let orch = orchestrator(backend);
        assert_eq!(orch.connect_open("Lab", false).await, ConnectionOutcome::Joined);
    }

    #[tokio::test]
    async fn test_user_denied_is_normalized() {
        let backend = FakeBackend::new().with_behavior(Behavior::Fail(BackendFailure::UserDenied));
        let orch = orchestrator(backend);
        let outcome = orch.secure_connect("Lab", "pw123456", false, false).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::UserDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_backend_times_out_and_frees_key() {
        let config = OrchestratorConfig {
            timeout: Duration::from_secs(10),
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::new(FakeBackend::new(), config);
        orch.backend().push_behavior(Behavior::Never);

        let started = tokio::time::Instant::now();
        let outcome = orch.connect_open("Lab", true).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::TimedOut));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(orch.registry().is_empty());
        assert_eq!(orch.backend().cancelled().len(), 1);

        // The late callback is discarded, and the key accepts a new request.
        assert_eq!(orch.backend().release_held(Ok(())), 0);
        assert_eq!(orch.connect_open("Lab", true).await, ConnectionOutcome::Joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_deadline_capped_by_config() {
        let caps = Capabilities {
            supports_prefix_match: true,
            join_timeout: Some(Duration::from_secs(5)),
            ..Capabilities::default()
        };
        let backend = FakeBackend::new()
            .with_capabilities(caps)
            .with_behavior(Behavior::Never);
        let orch = orchestrator(backend);
        let pending = orch.begin(ConnectionRequest::open("Lab", true)).unwrap();
        assert_eq!(pending.deadline(), Duration::from_secs(5));

        let config = OrchestratorConfig {
            timeout: Duration::from_secs(2),
            ..OrchestratorConfig::default()
        };
        let capped = Orchestrator::new(FakeBackend::new().with_capabilities(caps), config);
        assert_eq!(capped.deadline(&caps), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_answer_within_deadline() {
        let backend = FakeBackend::new()
            .with_behavior(Behavior::Delayed(Duration::from_secs(3), Ok(())));
        let orch = orchestrator(backend);
        assert!(orch.connect_open("Lab", false).await.is_joined());
    }

    #[tokio::test]
    async fn test_double_resolution_delivers_once() {
        let backend = FakeBackend::new().with_behavior(Behavior::ResolveTwice(
            Ok(()),
            Err(BackendFailure::native("dup", "second callback")),
        ));
        let orch = orchestrator(backend);
        assert_eq!(orch.connect_open("Lab", false).await, ConnectionOutcome::Joined);
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn test_prefix_without_capability_is_unsupported() {
        let backend = FakeBackend::new().with_capabilities(Capabilities::default());
        let orch = orchestrator(backend);
        let outcome = orch.connect_with_prefix("Printer-", false).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Unsupported));
        let outcome = orch
            .secure_prefix_connect("Printer-", "pw123456", false, false)
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Unsupported));
        assert_eq!(orch.backend().apply_count(), 0);
    }

    #[tokio::test]
    async fn test_prefix_with_capability_dispatches() {
        let orch = orchestrator(FakeBackend::new());
        assert!(orch.connect_with_prefix("Printer-", false).await.is_joined());
        let applied = orch.backend().applied();
        assert_eq!(applied[0].mode(), crate::request::TargetMode::Prefix);
    }

    #[tokio::test]
    async fn test_explicit_cancel() {
        let orch = orchestrator(FakeBackend::new().with_behavior(Behavior::Never));
        let pending = orch.begin(ConnectionRequest::open("Lab", true)).unwrap();
        let key = pending.key().clone();

        assert!(orch.cancel(&key));
        assert!(!orch.cancel(&key));
        assert!(!orch.registry().is_pending(&key));
        assert_eq!(pending.wait().await.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(orch.backend().cancelled(), vec![key]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_does_not_leak_backend() {
        let config = OrchestratorConfig {
            timeout: Duration::from_secs(1),
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::new(FakeBackend::new().with_behavior(Behavior::Never), config);
        let backend = Arc::downgrade(&orch.backend);

        let outcome = orch.connect_open("Lab", false).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::TimedOut));

        drop(orch);
        assert_eq!(backend.strong_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_backend_makes_abort_a_noop() {
        let orch = orchestrator(FakeBackend::new().with_behavior(Behavior::Never));
        let pending = orch.begin(ConnectionRequest::open("Lab", true)).unwrap();
        drop(orch);
        assert!(pending.cancel());
        assert_eq!(pending.wait().await.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_handle_from_other_task() {
        let orch = orchestrator(FakeBackend::new().with_behavior(Behavior::Never));
        let pending = orch.begin(ConnectionRequest::open("Lab", true)).unwrap();
        let handle = pending.cancel_handle();
        let canceller = tokio::spawn(async move { handle.cancel() });

        assert_eq!(pending.wait().await.error_kind(), Some(ErrorKind::Cancelled));
        assert!(canceller.await.unwrap());
        assert_eq!(orch.backend().release_held(Ok(())), 0);
    }

    #[tokio::test]
    async fn test_shared_registry_spans_orchestrators() {
        let registry = Arc::new(InFlightRegistry::new());
        let a = Orchestrator::with_registry(
            FakeBackend::new().with_behavior(Behavior::Never),
            OrchestratorConfig::default(),
            Arc::clone(&registry),
        );
        let b = Orchestrator::with_registry(
            FakeBackend::new(),
            OrchestratorConfig::default(),
            Arc::clone(&registry),
        );

        let _pending = a.begin(ConnectionRequest::open("Lab", true)).unwrap();
        let outcome = b.connect_open("Lab", true).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::AlreadyInProgress));
        assert_eq!(b.backend().apply_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_with_nothing_saved() {
        let orch = orchestrator(FakeBackend::new());
        assert!(orch.disconnect().await);
    }

    #[tokio::test]
    async fn test_disconnect_forgets_own_only_by_default() {
        let backend = FakeBackend::new().with_saved_network("Neighbour", false);
        let orch = orchestrator(backend);
        assert!(orch.connect_open("Mine", true).await.is_joined());
        assert!(orch.connect_open("JustOnce", false).await.is_joined());

        assert!(orch.disconnect().await);
        let remaining: Vec<String> = orch
            .backend()
            .saved_networks()
            .iter()
            .map(|n| n.ssid().to_string())
            .collect();
        assert_eq!(remaining, vec!["Neighbour".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_forget_all() {
        let backend = FakeBackend::new()
            .with_saved_network("Neighbour", false)
            .with_saved_network("Mine", true);
        let config = OrchestratorConfig {
            forget_policy: ForgetPolicy::ForgetAll,
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::new(backend, config);
        assert!(orch.disconnect().await);
        assert!(orch.backend().saved_networks().is_empty());
        assert_eq!(orch.backend().forgotten().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_reports_success_when_listing_fails() {
        let orch = orchestrator(FakeBackend::new().with_listing_failure());
        assert!(orch.disconnect().await);
    }
}
