pub mod dbus_proxies;
pub mod fake;
pub mod network_manager;

pub use fake::{Behavior, FakeBackend};
pub use network_manager::NetworkManagerBackend;

use crate::error::BackendFailure;
use crate::orchestrator::Completion;
use crate::request::{Capabilities, NormalizedRequest, TargetKey};

/// Something that can actually join a network.
///
/// The orchestrator only talks to this trait; it never looks inside a
/// concrete backend.
#[allow(async_fn_in_trait)]
pub trait WifiBackend: Send + Sync + 'static {
    /// Capability flags checked before any request is dispatched
    fn capabilities(&self) -> Capabilities;

    /// Begin a join attempt and report its result through `completion`.
    ///
    /// Called concurrently for distinct target keys. Reporting twice is
    /// tolerated; only the first report reaches the caller.
    fn apply(&self, request: NormalizedRequest, completion: Completion);

    /// Advisory abort for a request the orchestrator stopped waiting on.
    /// Backends that cannot abort a native join may ignore it.
    fn cancel(&self, _key: &TargetKey) {}

    /// Saved network entries the backend knows about
    async fn list_saved_networks(&self) -> Result<Vec<SavedNetworkRef>, BackendFailure>;

    /// Remove a saved entry. Forgetting an entry that is already gone succeeds.
    async fn forget(&self, network: &SavedNetworkRef) -> Result<(), BackendFailure>;

    /// SSID of the network currently in use, if it can be determined quickly
    async fn current_network_name(&self) -> Option<String>;
}

/// Backend-owned handle to a persisted network entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SavedNetworkRef {
    handle: String,
    ssid: String,
    own: bool,
}

impl SavedNetworkRef {
    pub fn new(handle: impl Into<String>, ssid: impl Into<String>, own: bool) -> Self {
        Self {
            handle: handle.into(),
            ssid: ssid.into(),
            own,
        }
    }

    /// Backend-specific identifier; meaningful only to the backend that made it
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// Whether this entry was saved by this application instance
    pub fn is_own(&self) -> bool {
        self.own
    }
}
