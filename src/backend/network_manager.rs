use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::Connection;

use super::dbus_proxies::*;
use super::{SavedNetworkRef, WifiBackend};
use crate::error::{BackendFailure, ConnectResult};
use crate::orchestrator::Completion;
use crate::request::{Capabilities, NormalizedRequest, Security, TargetKey, MAX_SSID_BYTES};

const NM_DEVICE_TYPE_WIFI: u32 = 2;
const NM_ACTIVE_CONNECTION_STATE_ACTIVATED: u32 = 2;
const NM_ACTIVE_CONNECTION_STATE_DEACTIVATED: u32 = 4;
const WIRELESS_TYPE: &str = "802-11-wireless";
/// wep-key-type 1: the key is used as-is (hex or ASCII)
const WEP_KEY_TYPE_KEY: u32 = 1;
const ACTIVATION_POLL: Duration = Duration::from_millis(500);
/// `user.data` entry marking profiles this application saved
const OWNER_KEY: &str = "org.wifi-connect.owner";
const OWNER_VALUE: &str = "wifi-connect";

/// Joins networks through NetworkManager on the system bus.
///
/// NetworkManager cannot match SSIDs by prefix, so prefix requests are
/// rejected before they get here.
#[derive(Debug)]
pub struct NetworkManagerBackend {
    connection: Connection,
    query_timeout: Duration,
    join_timeout: Option<Duration>,
    /// Settings paths of profiles saved by this process, for profiles
    /// whose owner tag cannot be read back
    created: Arc<Mutex<HashSet<String>>>,
    /// Active connections still coming up, by target
    activating: Arc<Mutex<HashMap<TargetKey, OwnedObjectPath>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NetworkManagerBackend {
    /// Connect to the system D-Bus and check that NetworkManager answers
    pub async fn new(query_timeout: Duration, join_timeout: Option<Duration>) -> ConnectResult<Self> {
        let connection = Connection::system().await?;
        let nm = NetworkManagerProxy::new(&connection).await?;
        info!("Connected to NetworkManager v{}", nm.version().await?);

        if unsafe { libc::geteuid() } != 0 {
            info!("Not running as root, polkit may prompt before joins");
        }
        if find_wifi_device(&connection).await?.is_none() {
            warn!("No WiFi device found; joins will fail until one appears");
        }

        Ok(Self {
            connection,
            query_timeout,
            join_timeout,
            created: Arc::new(Mutex::new(HashSet::new())),
            activating: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl WifiBackend for NetworkManagerBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_prefix_match: false,
            max_ssid_length: MAX_SSID_BYTES,
            join_timeout: self.join_timeout,
        }
    }

    fn apply(&self, request: NormalizedRequest, completion: Completion) {
        let Ok(runtime) = Handle::try_current() else {
            completion.fail(BackendFailure::native(
                "NoRuntime",
                "join requested outside a tokio runtime",
            ));
            return;
        };

        let connection = self.connection.clone();
        let created = Arc::clone(&self.created);
        let activating = Arc::clone(&self.activating);
        runtime.spawn(async move {
            let report = join(&connection, &request, &completion, &created, &activating).await;
            completion.resolve(report);
        });
    }

    fn cancel(&self, key: &TargetKey) {
        let Some(active_path) = lock(&self.activating).remove(key) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let connection = self.connection.clone();
        runtime.spawn(async move {
            let result: zbus::Result<()> = async {
                let nm = NetworkManagerProxy::new(&connection).await?;
                nm.deactivate_connection(&active_path.as_ref()).await
            }
            .await;
            match result {
                Ok(()) => info!("Deactivated connection: {}", active_path),
                Err(e) => debug!("Failed to deactivate {}: {}", active_path, e),
            }
        });
    }

    async fn list_saved_networks(&self) -> Result<Vec<SavedNetworkRef>, BackendFailure> {
        let settings = SettingsProxy::new(&self.connection)
            .await
            .map_err(failure_from_dbus)?;
        let paths = settings.list_connections().await.map_err(failure_from_dbus)?;
        let created = lock(&self.created).clone();

        let mut networks = Vec::new();
        for path in paths {
            match saved_wireless(&self.connection, &path).await {
                Ok(Some((ssid, tagged))) => {
                    let own = tagged || created.contains(path.as_str());
                    networks.push(SavedNetworkRef::new(path.as_str(), ssid, own));
                }
                Ok(None) => {} // Not a WiFi profile
                Err(e) => debug!("Failed to read connection {}: {}", path, e),
            }
        }
        Ok(networks)
    }

    async fn forget(&self, network: &SavedNetworkRef) -> Result<(), BackendFailure> {
        let proxy = ConnectionSettingsProxy::builder(&self.connection)
            .path(network.handle())
            .map_err(failure_from_dbus)?
            .build()
            .await
            .map_err(failure_from_dbus)?;

        match proxy.delete().await {
            Ok(()) => info!("Deleted connection: {}", network.handle()),
            Err(e) if is_missing_object(&e) => {
                debug!("Connection {} already gone", network.handle())
            }
            Err(e) => return Err(failure_from_dbus(e)),
        }
        lock(&self.created).remove(network.handle());
        Ok(())
    }

    async fn current_network_name(&self) -> Option<String> {
        match tokio::time::timeout(self.query_timeout, current_ssid(&self.connection)).await {
            Ok(Ok(ssid)) => ssid,
            Ok(Err(e)) => {
                debug!("Failed to read current SSID: {}", e);
                None
            }
            Err(_) => {
                warn!("Reading current SSID took longer than {:?}", self.query_timeout);
                None
            }
        }
    }
}

// ── Join ──────────────────────────────────────────────────────────────

async fn join(
    connection: &Connection,
    request: &NormalizedRequest,
    completion: &Completion,
    created: &Mutex<HashSet<String>>,
    activating: &Mutex<HashMap<TargetKey, OwnedObjectPath>>,
) -> Result<(), BackendFailure> {
    let device = find_wifi_device(connection)
        .await
        .map_err(failure_from_dbus)?
        .ok_or_else(|| BackendFailure::native("NoWifiDevice", "no WiFi device available"))?;

    let current = active_ssid(connection, &device).await.ok().flatten();
    if current.as_deref() == Some(request.ssid()) {
        return Err(BackendFailure::AlreadyAssociated);
    }

    let nm = NetworkManagerProxy::new(connection)
        .await
        .map_err(failure_from_dbus)?;
    let root = ObjectPath::from_static_str_unchecked("/");
    let options = HashMap::from([("persist", Value::from(persist_mode(request)))]);

    let (settings_path, active_path, _) = nm
        .add_and_activate_connection2(
            connection_settings(request),
            &device.as_ref(),
            &root,
            options,
        )
        .await
        .map_err(failure_from_dbus)?;
    debug!(
        "Added profile {} for '{}', active connection {}",
        settings_path,
        request.ssid(),
        active_path
    );

    if request.persist() {
        lock(created).insert(settings_path.as_str().to_string());
    }
    lock(activating).insert(request.key().clone(), active_path.clone());

    let result = wait_for_activation(connection, &active_path, completion).await;

    let mut activating = lock(activating);
    if activating.get(request.key()) == Some(&active_path) {
        activating.remove(request.key());
    }
    result
}

/// Poll the active connection until it is up, gone, or nobody is waiting.
async fn wait_for_activation(
    connection: &Connection,
    path: &OwnedObjectPath,
    completion: &Completion,
) -> Result<(), BackendFailure> {
    let proxy = ActiveConnectionProxy::builder(connection)
        .path(path.clone())
        .map_err(failure_from_dbus)?
        .build()
        .await
        .map_err(failure_from_dbus)?;

    let mut interval = tokio::time::interval(ACTIVATION_POLL);
    loop {
        interval.tick().await;
        if completion.is_settled() {
            debug!("Stopped watching {}: request already settled", path);
            return Ok(());
        }

        match proxy.state().await {
            Ok(NM_ACTIVE_CONNECTION_STATE_ACTIVATED) => {
                info!(
                    "Connected to WiFi '{}', active connection: {}",
                    proxy.id().await.unwrap_or_default(),
                    path
                );
                return Ok(());
            }
            Ok(NM_ACTIVE_CONNECTION_STATE_DEACTIVATED) => {
                return Err(BackendFailure::native(
                    "ActivationFailed",
                    "connection was deactivated before it came up",
                ));
            }
            Ok(_) => {}
            // Volatile profiles vanish together with a failed activation.
            Err(e) if is_missing_object(&e) => {
                return Err(BackendFailure::native(
                    "ActivationFailed",
                    "active connection disappeared before it came up",
                ));
            }
            Err(e) => return Err(failure_from_dbus(e)),
        }
    }
}

fn persist_mode(request: &NormalizedRequest) -> &'static str {
    if request.persist() {
        "disk"
    } else {
        "volatile"
    }
}

/// Settings dict for a new 802-11-wireless profile
fn connection_settings(
    request: &NormalizedRequest,
) -> HashMap<&'static str, HashMap<&'static str, Value<'_>>> {
    let ssid = request.ssid();
    let mut settings = HashMap::from([
        (
            "connection",
            HashMap::from([
                ("id", Value::from(ssid)),
                ("type", Value::from(WIRELESS_TYPE)),
                ("autoconnect", Value::from(request.persist())),
            ]),
        ),
        (
            WIRELESS_TYPE,
            HashMap::from([
                ("ssid", Value::Array(ssid.as_bytes().into())),
                ("mode", Value::from("infrastructure")),
            ]),
        ),
        ("ipv4", HashMap::from([("method", Value::from("auto"))])),
        ("ipv6", HashMap::from([("method", Value::from("auto"))])),
        (
            "user",
            HashMap::from([(
                "data",
                Value::from(HashMap::from([(OWNER_KEY, OWNER_VALUE)])),
            )]),
        ),
    ]);

    if let Security::Psk {
        passphrase,
        legacy_wep,
    } = request.security()
    {
        let security = if *legacy_wep {
            HashMap::from([
                ("key-mgmt", Value::from("none")),
                ("wep-key0", Value::from(passphrase.as_str())),
                ("wep-key-type", Value::from(WEP_KEY_TYPE_KEY)),
            ])
        } else {
            HashMap::from([
                ("key-mgmt", Value::from("wpa-psk")),
                ("psk", Value::from(passphrase.as_str())),
            ])
        };
        settings.insert("802-11-wireless-security", security);
    }

    settings
}

// ── Queries ───────────────────────────────────────────────────────────

/// Find the first WiFi device path
async fn find_wifi_device(connection: &Connection) -> zbus::Result<Option<OwnedObjectPath>> {
    let nm_proxy = NetworkManagerProxy::new(connection).await?;
    let devices = nm_proxy.get_devices().await?;

    for path in devices {
        let dev_proxy = DeviceProxy::builder(connection)
            .path(path.clone())?
            .build()
            .await?;

        if dev_proxy.device_type().await.unwrap_or(0) == NM_DEVICE_TYPE_WIFI {
            debug!(
                "Using WiFi device {}",
                dev_proxy.interface().await.unwrap_or_default()
            );
            return Ok(Some(path));
        }
    }

    Ok(None)
}

/// SSID of the access point the device is associated with
async fn active_ssid(
    connection: &Connection,
    device: &OwnedObjectPath,
) -> zbus::Result<Option<String>> {
    let wireless = WirelessProxy::builder(connection)
        .path(device.clone())?
        .build()
        .await?;
    let ap_path = wireless.active_access_point().await?;
    if ap_path.as_str() == "/" {
        return Ok(None);
    }

    let ap = AccessPointProxy::builder(connection)
        .path(ap_path)?
        .build()
        .await?;
    let ssid = ap.ssid().await?;
    Ok(Some(String::from_utf8_lossy(&ssid).into_owned()))
}

async fn current_ssid(connection: &Connection) -> zbus::Result<Option<String>> {
    match find_wifi_device(connection).await? {
        Some(device) => active_ssid(connection, &device).await,
        None => Ok(None),
    }
}

/// SSID of a saved profile and whether it carries our owner tag, or `None`
/// if it is not a WiFi profile
async fn saved_wireless(
    connection: &Connection,
    path: &OwnedObjectPath,
) -> zbus::Result<Option<(String, bool)>> {
    let conn_proxy = ConnectionSettingsProxy::builder(connection)
        .path(path.clone())?
        .build()
        .await?;
    let settings = conn_proxy.get_settings().await?;

    let conn_type = settings
        .get("connection")
        .and_then(|conn| conn.get("type"))
        .and_then(ov_to_string);
    if conn_type.as_deref() != Some(WIRELESS_TYPE) {
        return Ok(None);
    }

    let Some(ssid) = settings
        .get(WIRELESS_TYPE)
        .and_then(|wifi| wifi.get("ssid"))
        .and_then(ov_to_bytes)
    else {
        return Ok(None);
    };

    let tagged = settings
        .get("user")
        .and_then(|user| user.get("data"))
        .and_then(ov_to_string_map)
        .is_some_and(|data| data.get(OWNER_KEY).map(String::as_str) == Some(OWNER_VALUE));

    Ok(Some((String::from_utf8_lossy(&ssid).into_owned(), tagged)))
}

// ── Error mapping ─────────────────────────────────────────────────────

fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Map a D-Bus error name (e.g. `org.freedesktop.NetworkManager.PermissionDenied`)
/// onto a backend failure signal.
fn classify_error_name(name: &str, message: String) -> BackendFailure {
    match short_name(name) {
        "PermissionDenied" | "AccessDenied" | "NoSecrets" | "UserCanceled" => {
            BackendFailure::UserDenied
        }
        "NotSupported" => BackendFailure::Unsupported(if message.is_empty() {
            name.to_string()
        } else {
            message
        }),
        _ => BackendFailure::native(name, message),
    }
}

fn failure_from_dbus(err: zbus::Error) -> BackendFailure {
    match err {
        zbus::Error::MethodError(name, message, _) => {
            classify_error_name(name.as_str(), message.unwrap_or_default())
        }
        zbus::Error::FDO(fdo) => match *fdo {
            zbus::fdo::Error::AccessDenied(_) => BackendFailure::UserDenied,
            zbus::fdo::Error::NotSupported(message) => BackendFailure::Unsupported(message),
            other => BackendFailure::native("org.freedesktop.DBus.Error", other.to_string()),
        },
        other => BackendFailure::native("dbus", other.to_string()),
    }
}

fn is_missing_object(err: &zbus::Error) -> bool {
    match err {
        zbus::Error::MethodError(name, _, _) => {
            matches!(short_name(name.as_str()), "UnknownObject" | "UnknownMethod")
        }
        zbus::Error::FDO(fdo) => matches!(
            **fdo,
            zbus::fdo::Error::UnknownObject(_) | zbus::fdo::Error::UnknownMethod(_)
        ),
        _ => false,
    }
}

// ── Safe OwnedValue extraction via pattern matching ───────────────────
// OwnedValue derefs to Value<'static>, so &**v gives &Value to match on.

fn ov_to_string(v: &OwnedValue) -> Option<String> {
    match &**v {
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn ov_to_string_map(v: &OwnedValue) -> Option<HashMap<String, String>> {
    let value = (**v).try_clone().ok()?;
    HashMap::try_from(value).ok()
}

fn ov_to_bytes(v: &OwnedValue) -> Option<Vec<u8>> {
    match &**v {
        Value::Array(arr) => {
            let mut bytes = Vec::new();
            for item in arr.iter() {
                match item {
                    Value::U8(b) => bytes.push(*b),
                    _ => return None,
                }
            }
            Some(bytes)
        }
        _ => None,
    }
}
