//! Exactly-once result delivery.
//!
//! Each request owns one [`Slot`]. The backend's [`Completion`], the caller's
//! [`CancelHandle`] and the orchestrator's deadline all race to resolve it;
//! the first resolution wins, releases the registry entry and is delivered.
//! Every later attempt is a logged no-op.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{BackendFailure, ConnectionOutcome, ErrorKind, JoinError};
use crate::normalize::normalize;
use crate::request::TargetKey;

use super::registry::InFlightRegistry;

/// Advisory abort hook, invoked when a request ends without a backend answer
pub(crate) type AbortHook = Box<dyn Fn(&TargetKey) + Send + Sync>;

/// How a request reached its terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Backend(Result<(), BackendFailure>),
    Cancelled,
    TimedOut,
}

pub(crate) struct Slot {
    key: TargetKey,
    sender: Mutex<Option<oneshot::Sender<Resolution>>>,
    registry: Arc<InFlightRegistry>,
    abort: AbortHook,
}

impl Slot {
    pub(crate) fn new(
        key: TargetKey,
        registry: Arc<InFlightRegistry>,
        abort: AbortHook,
    ) -> (Arc<Self>, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Self {
            key,
            sender: Mutex::new(Some(tx)),
            registry,
            abort,
        });
        (slot, rx)
    }

    pub(crate) fn key(&self) -> &TargetKey {
        &self.key
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Settle the request. Returns false if it was already settled.
    pub(crate) fn resolve(&self, resolution: Resolution) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(sender) = sender else {
            debug!(target_key = %self.key, ?resolution, "discarding late resolution");
            return false;
        };

        // The key must still belong to this request when the backend aborts it.
        if matches!(resolution, Resolution::Cancelled | Resolution::TimedOut) {
            (self.abort)(&self.key);
        }
        self.registry.release(&self.key, self);
        // The receiver is gone only if the caller dropped its handle.
        let _ = sender.send(resolution);
        true
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("key", &self.key)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Handed to a backend with each request. Resolving it more than once is
/// harmless: only the first report counts.
#[derive(Clone)]
pub struct Completion {
    slot: Arc<Slot>,
}

impl Completion {
    pub(crate) fn new(slot: Arc<Slot>) -> Self {
        Self { slot }
    }

    pub fn key(&self) -> &TargetKey {
        self.slot.key()
    }

    /// Report the join result. Returns false if the request had already
    /// ended (earlier report, cancellation or timeout).
    pub fn resolve(&self, report: Result<(), BackendFailure>) -> bool {
        self.slot.resolve(Resolution::Backend(report))
    }

    pub fn succeed(&self) -> bool {
        self.resolve(Ok(()))
    }

    pub fn fail(&self, failure: BackendFailure) -> bool {
        self.resolve(Err(failure))
    }

    /// True once the orchestrator no longer waits for this request
    pub fn is_settled(&self) -> bool {
        self.slot.is_settled()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completion").field(&self.slot).finish()
    }
}

/// Cancels a pending request from anywhere. No-op after resolution.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    slot: Arc<Slot>,
}

impl CancelHandle {
    pub fn cancel(&self) -> bool {
        self.slot.resolve(Resolution::Cancelled)
    }

    pub fn key(&self) -> &TargetKey {
        self.slot.key()
    }
}

/// A dispatched request awaiting its outcome.
///
/// Dropping it before resolution cancels the request.
#[derive(Debug)]
pub struct PendingConnection {
    slot: Arc<Slot>,
    receiver: Option<oneshot::Receiver<Resolution>>,
    deadline: Duration,
}

impl PendingConnection {
    pub(crate) fn new(
        slot: Arc<Slot>,
        receiver: oneshot::Receiver<Resolution>,
        deadline: Duration,
    ) -> Self {
        Self {
            slot,
            receiver: Some(receiver),
            deadline,
        }
    }

    pub fn key(&self) -> &TargetKey {
        self.slot.key()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            slot: Arc::clone(&self.slot),
        }
    }

    pub fn cancel(&self) -> bool {
        self.slot.resolve(Resolution::Cancelled)
    }

    /// Wait for the single outcome of this request, bounded by the deadline.
    pub async fn wait(mut self) -> ConnectionOutcome {
        let Some(mut receiver) = self.receiver.take() else {
            return ConnectionOutcome::Failed(JoinError::new(
                ErrorKind::Cancelled,
                "request was already awaited",
            ));
        };

        let received = match tokio::time::timeout(self.deadline, &mut receiver).await {
            Ok(received) => received,
            Err(_) => {
                if self.slot.resolve(Resolution::TimedOut) {
                    warn!(
                        target_key = %self.slot.key(),
                        "no backend response within {:?}",
                        self.deadline
                    );
                }
                // Whoever won the race has already sent.
                receiver.await
            }
        };

        match received {
            Ok(resolution) => normalize(self.slot.key(), resolution),
            Err(_) => ConnectionOutcome::Failed(JoinError::new(
                ErrorKind::BackendError,
                "completion channel closed without a result",
            )),
        }
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        if !self.slot.is_settled() {
            self.slot.resolve(Resolution::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::request::ConnectionRequest;

    fn pending(deadline: Duration) -> (PendingConnection, Completion, Arc<InFlightRegistry>) {
        let registry = Arc::new(InFlightRegistry::new());
        let key = ConnectionRequest::open("Cafe", false).target_key();
        let (slot, rx) = Slot::new(key.clone(), Arc::clone(&registry), Box::new(|_: &TargetKey| {}));
        assert!(registry.try_register(&key, &slot));
        let completion = Completion::new(Arc::clone(&slot));
        (PendingConnection::new(slot, rx, deadline), completion, registry)
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let (pending, completion, registry) = pending(Duration::from_secs(5));
        assert!(completion.succeed());
        assert!(!completion.fail(BackendFailure::UserDenied));
        assert!(registry.is_empty());
        assert_eq!(pending.wait().await, ConnectionOutcome::Joined);
    }

    #[tokio::test]
    async fn test_cancel_after_resolution_is_noop() {
        let (pending, completion, _registry) = pending(Duration::from_secs(5));
        let handle = pending.cancel_handle();
        assert!(completion.fail(BackendFailure::UserDenied));
        assert!(!handle.cancel());
        assert_eq!(
            pending.wait().await.error_kind(),
            Some(ErrorKind::UserDenied)
        );
    }

    #[tokio::test]
    async fn test_cancel_before_resolution() {
        let (pending, completion, registry) = pending(Duration::from_secs(5));
        assert!(pending.cancel());
        assert!(registry.is_empty());
        assert!(completion.is_settled());
        assert!(!completion.succeed());
        assert_eq!(pending.wait().await.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_resolves_timed_out() {
        let (pending, completion, registry) = pending(Duration::from_secs(3));
        assert_eq!(pending.wait().await.error_kind(), Some(ErrorKind::TimedOut));
        assert!(registry.is_empty());
        assert!(!completion.succeed());
    }

    #[tokio::test]
    async fn test_drop_releases_entry_and_aborts() {
        let registry = Arc::new(InFlightRegistry::new());
        let aborted = Arc::new(AtomicUsize::new(0));
        let key = ConnectionRequest::open("Cafe", false).target_key();
        let counter = Arc::clone(&aborted);
        let (slot, rx) = Slot::new(
            key.clone(),
            Arc::clone(&registry),
            Box::new(move |_: &TargetKey| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(registry.try_register(&key, &slot));
        let completion = Completion::new(Arc::clone(&slot));

        drop(PendingConnection::new(slot, rx, Duration::from_secs(5)));

        assert!(registry.is_empty());
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
        assert!(!completion.succeed());
    }

    #[tokio::test]
    async fn test_abort_runs_while_key_still_registered() {
        let registry = Arc::new(InFlightRegistry::new());
        let key = ConnectionRequest::open("Cafe", false).target_key();
        let held_during_abort = Arc::new(AtomicUsize::new(0));
        let (observer, counter) = (Arc::clone(&registry), Arc::clone(&held_during_abort));
        let (slot, rx) = Slot::new(
            key.clone(),
            Arc::clone(&registry),
            Box::new(move |key: &TargetKey| {
                if observer.is_pending(key) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        assert!(registry.try_register(&key, &slot));
        let pending = PendingConnection::new(slot, rx, Duration::from_secs(5));

        assert!(pending.cancel());
        assert_eq!(held_during_abort.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
