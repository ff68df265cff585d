use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use super::{SavedNetworkRef, WifiBackend};
use crate::error::BackendFailure;
use crate::orchestrator::Completion;
use crate::request::{Capabilities, NormalizedRequest, TargetKey};

/// What the fake does with one `apply` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Resolve immediately with success
    Succeed,
    /// Resolve immediately with the given failure
    Fail(BackendFailure),
    /// Never resolve; the completion is held until [`FakeBackend::release_held`]
    Never,
    /// Resolve twice in a row, like a misbehaving native callback
    ResolveTwice(Result<(), BackendFailure>, Result<(), BackendFailure>),
    /// Resolve from a background task after a delay
    Delayed(Duration, Result<(), BackendFailure>),
}

/// Deterministic in-memory backend for tests and dry runs.
#[derive(Debug)]
pub struct FakeBackend {
    caps: Capabilities,
    default_behavior: Behavior,
    script: Mutex<VecDeque<Behavior>>,
    saved: Mutex<Vec<SavedNetworkRef>>,
    current: Mutex<Option<String>>,
    held: Mutex<Vec<Completion>>,
    applied: Mutex<Vec<NormalizedRequest>>,
    cancelled: Mutex<Vec<TargetKey>>,
    forgotten: Mutex<Vec<SavedNetworkRef>>,
    listing_fails: bool,
    next_handle: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// A backend that joins everything and supports prefix matching
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                supports_prefix_match: true,
                ..Capabilities::default()
            },
            default_behavior: Behavior::Succeed,
            script: Mutex::new(VecDeque::new()),
            saved: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            held: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            forgotten: Mutex::new(Vec::new()),
            listing_fails: false,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Behavior used once the per-call script is exhausted
    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn with_saved_network(self, ssid: &str, own: bool) -> Self {
        let network = SavedNetworkRef::new(self.handle(), ssid, own);
        lock(&self.saved).push(network);
        self
    }

    pub fn with_current_network(self, ssid: &str) -> Self {
        *lock(&self.current) = Some(ssid.to_string());
        self
    }

    /// Make `list_saved_networks` fail
    pub fn with_listing_failure(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    /// Queue a behavior for the next `apply` call
    pub fn push_behavior(&self, behavior: Behavior) {
        lock(&self.script).push_back(behavior);
    }

    /// Resolve every held completion with `report`; returns how many were
    /// actually delivered.
    pub fn release_held(&self, report: Result<(), BackendFailure>) -> usize {
        let held: Vec<Completion> = lock(&self.held).drain(..).collect();
        held.iter()
            .filter(|completion| completion.resolve(report.clone()))
            .count()
    }

    pub fn apply_count(&self) -> usize {
        lock(&self.applied).len()
    }

    pub fn applied(&self) -> Vec<NormalizedRequest> {
        lock(&self.applied).clone()
    }

    pub fn cancelled(&self) -> Vec<TargetKey> {
        lock(&self.cancelled).clone()
    }

    pub fn saved_networks(&self) -> Vec<SavedNetworkRef> {
        lock(&self.saved).clone()
    }

    pub fn forgotten(&self) -> Vec<SavedNetworkRef> {
        lock(&self.forgotten).clone()
    }

    fn handle(&self) -> String {
        format!("fake-{}", self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn next_behavior(&self) -> Behavior {
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone())
    }

    fn record_join(&self, request: &NormalizedRequest) {
        *lock(&self.current) = Some(request.ssid().to_string());
        if !request.persist() {
            return;
        }
        let mut saved = lock(&self.saved);
        if !saved.iter().any(|n| n.ssid() == request.ssid()) {
            saved.push(SavedNetworkRef::new(self.handle(), request.ssid(), true));
        }
    }
}

impl WifiBackend for FakeBackend {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn apply(&self, request: NormalizedRequest, completion: Completion) {
        let behavior = self.next_behavior();
        debug!(target_key = %request.key(), ?behavior, "fake apply");
        lock(&self.applied).push(request.clone());

        match behavior {
            Behavior::Succeed => {
                self.record_join(&request);
                completion.succeed();
            }
            Behavior::Fail(failure) => {
                completion.fail(failure);
            }
            Behavior::Never => lock(&self.held).push(completion),
            Behavior::ResolveTwice(first, second) => {
                if first.is_ok() {
                    self.record_join(&request);
                }
                completion.resolve(first);
                completion.resolve(second);
            }
            Behavior::Delayed(delay, report) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    completion.resolve(report);
                });
            }
        }
    }

    fn cancel(&self, key: &TargetKey) {
        lock(&self.cancelled).push(key.clone());
        lock(&self.held).retain(|completion| completion.key() != key);
    }

    async fn list_saved_networks(&self) -> Result<Vec<SavedNetworkRef>, BackendFailure> {
        if self.listing_fails {
            return Err(BackendFailure::native("fake", "listing disabled"));
        }
        Ok(lock(&self.saved).clone())
    }

    async fn forget(&self, network: &SavedNetworkRef) -> Result<(), BackendFailure> {
        let mut saved = lock(&self.saved);
        if let Some(pos) = saved.iter().position(|n| n.handle() == network.handle()) {
            let removed = saved.remove(pos);
            lock(&self.forgotten).push(removed);
        }
        Ok(())
    }

    async fn current_network_name(&self) -> Option<String> {
        lock(&self.current).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forget_is_idempotent() {
        let backend = FakeBackend::new().with_saved_network("Home", true);
        let home = backend.list_saved_networks().await.unwrap().remove(0);

        assert!(backend.forget(&home).await.is_ok());
        assert!(backend.forget(&home).await.is_ok());
        assert!(backend.saved_networks().is_empty());
        assert_eq!(backend.forgotten(), vec![home]);
    }

    #[tokio::test]
    async fn test_listing_is_restartable() {
        let backend = FakeBackend::new()
            .with_saved_network("A", true)
            .with_saved_network("B", false);
        let first = backend.list_saved_networks().await.unwrap();
        let second = backend.list_saved_networks().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_ne!(first[0].handle(), first[1].handle());
    }

    #[tokio::test]
    async fn test_current_network_name() {
        assert_eq!(FakeBackend::new().current_network_name().await, None);
        let backend = FakeBackend::new().with_current_network("Lobby");
        assert_eq!(backend.current_network_name().await.as_deref(), Some("Lobby"));
    }

    #[test]
    fn test_script_falls_back_to_default() {
        let backend = FakeBackend::new().with_behavior(Behavior::Never);
        backend.push_behavior(Behavior::Succeed);
        assert_eq!(backend.next_behavior(), Behavior::Succeed);
        assert_eq!(backend.next_behavior(), Behavior::Never);
    }
}
