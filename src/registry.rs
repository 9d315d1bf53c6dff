//! Device registry: one entry per physical robot, independent of any live
//! connection.
//!
//! The registry is the only state shared between connections; everything
//! inside a `Device` is serialized by its own mutex, and no lock is ever held
//! across an await point. Both the HTTP collaborator and a robot's own
//! protocol connection reach the same `Device` through here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::battery_guard::{self, BatteryGuard, GuardConfig};
use crate::commands::{self, CommandError, Params};
use crate::connection::ConnectionHandle;
use crate::map;
use crate::settings::Settings;
use crate::status::StatusCache;

/// Cleaning-mode names in persisted `mode` index order.
const MODE_NAMES: &[&str] = &["auto", "gyro", "random", "borders", "area", "x2", "scrub"];

/// What a command attempt produced, surfaced verbatim to HTTP callers:
/// numeric error code, response body, content type.
///
/// Codes: 0 ok, 1 missing device id, 2 unknown device id, 3 not connected,
/// 4 not identified, 5 unknown command, 6 missing parameter, 7 invalid value,
/// 8 unknown persistent key.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub error: u8,
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

impl CommandOutcome {
    pub fn json(error: u8, body: impl Into<String>) -> Self {
        Self {
            error,
            body: body.into().into_bytes(),
            content_type: "application/json",
        }
    }

    pub fn ok() -> Self {
        Self::json(0, "{}")
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            error: 0,
            body: bytes,
            content_type: "image/png",
        }
    }
}

impl From<&CommandError> for CommandOutcome {
    fn from(err: &CommandError) -> Self {
        Self::json(err.code(), format!("\"{err}\""))
    }
}

struct DeviceInner {
    connection: Option<ConnectionHandle>,
    status: StatusCache,
    settings: Settings,
    guard: BatteryGuard,
}

/// One physical robot, addressed by its stable vendor-assigned id. Created
/// lazily on first reference and kept for the life of the process;
/// disconnection only resets the cached status.
pub struct Device {
    id: String,
    inner: Mutex<DeviceInner>,
}

impl Device {
    fn new(id: &str, config_dir: &Path) -> Self {
        Self {
            id: id.to_string(),
            inner: Mutex::new(DeviceInner {
                connection: None,
                status: StatusCache::new(),
                settings: Settings::load(config_dir, id),
                guard: BatteryGuard::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connection.is_some()
    }

    /// Claim this device for a freshly identified connection, forcibly
    /// closing any previous one. At most one live connection per device.
    pub(crate) fn attach(&self, handle: ConnectionHandle) {
        let previous = self.inner.lock().connection.replace(handle);
        if let Some(old) = previous {
            info!(device = %self.id, "closing superseded connection");
            old.close();
        }
    }

    /// Drop the live connection if it is still the one identified by
    /// `conn_id`; a superseded connection arriving late must not clobber its
    /// replacement. Detaching resets the status cache and guard counters.
    pub(crate) fn detach(&self, conn_id: u64) {
        let mut inner = self.inner.lock();
        if inner.connection.as_ref().map(ConnectionHandle::id) == Some(conn_id) {
            inner.connection = None;
            inner.status.reset();
            inner.guard.reset();
        }
    }

    /// Merge a status report and evaluate the battery guard. Returns true
    /// when the recovery sequence should be queued.
    pub(crate) fn apply_status(&self, value: &Map<String, Value>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.status.merge_report(value) {
            return false;
        }
        let work_state = inner.status.work_state().to_string();
        let battery = inner.status.battery();
        let config = GuardConfig {
            enabled: inner.settings.guard_enabled(),
            level: inner.settings.guard_level(),
            times: inner.settings.guard_times(),
        };
        inner.guard.observe(&work_state, battery, config)
    }

    /// Merge telemetry carried by ack and map payloads; no guard evaluation.
    pub(crate) fn merge_telemetry(&self, value: &Map<String, Value>) {
        self.inner.lock().status.merge_report(value);
    }

    /// Whitelisted fields submitted over the vendor-compat HTTP endpoints.
    pub fn http_data_update(&self, fields: &Params) {
        let mut inner = self.inner.lock();
        for (key, value) in fields {
            inner.status.set(key, value.clone());
        }
    }

    pub fn status_json(&self) -> Value {
        self.inner.lock().status.to_json()
    }

    /// Queue the battery-guard recovery sequence through the normal command
    /// path. Fire-and-queue: a disconnect mid-sequence discards the rest.
    pub(crate) fn start_recovery(&self) {
        let (fan, water) = {
            let inner = self.inner.lock();
            (inner.settings.fan(), inner.settings.water())
        };
        info!(device = %self.id, "battery guard triggered, queueing recovery sequence");
        for (name, params) in battery_guard::recovery_sequence(&fan, &water) {
            let outcome = self.send_command(name, &params);
            if outcome.error != 0 {
                warn!(
                    device = %self.id,
                    step = name,
                    error = outcome.error,
                    "recovery step rejected, abandoning sequence"
                );
                break;
            }
        }
    }

    /// Registry-level pseudo-commands are handled here; everything else is
    /// compiled, validated, and handed to the live connection's queue.
    pub fn send_command(&self, name: &str, params: &Params) -> CommandOutcome {
        let mut inner = self.inner.lock();
        let Some(connection) = inner.connection.clone() else {
            return CommandOutcome::from(&CommandError::NotConnected);
        };

        match name {
            "getStatus" => CommandOutcome::json(0, inner.status.to_json().to_string()),

            "getProperty" => {
                let Some(key) = params.get("key") else {
                    return CommandOutcome::from(&CommandError::MissingParameter("key"));
                };
                match inner.settings.get(key) {
                    Some(value) => {
                        let body = Value::Object(
                            [(key.clone(), Value::String(value.to_string()))]
                                .into_iter()
                                .collect(),
                        );
                        CommandOutcome::json(0, body.to_string())
                    }
                    None => CommandOutcome::from(&CommandError::UnknownKey(key.clone())),
                }
            }

            "setProperty" => {
                let Some(key) = params.get("key") else {
                    return CommandOutcome::from(&CommandError::MissingParameter("key"));
                };
                let Some(value) = params.get("value") else {
                    return CommandOutcome::from(&CommandError::MissingParameter("value"));
                };
                if let Err(err) = inner.settings.set(key, value) {
                    warn!(device = %self.id, key = %key, %err, "settings write failed");
                }
                CommandOutcome::json(0, "\"OK\"")
            }

            "setDefaults" => {
                let fan = inner.settings.fan();
                let water = inner.settings.water();
                let mode = MODE_NAMES
                    .get(inner.settings.mode_index())
                    .copied()
                    .unwrap_or("auto");
                drop(inner);
                for (name, params) in [
                    ("fan", &[("speed", fan.as_str())][..]),
                    ("watertank", &[("speed", water.as_str())][..]),
                    ("mode", &[("type", mode)][..]),
                ] {
                    let params: Params = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    let outcome = self.send_command(name, &params);
                    if outcome.error != 0 {
                        return outcome;
                    }
                }
                CommandOutcome::ok()
            }

            "resetBattery" => {
                inner.guard.reset();
                CommandOutcome::json(0, "\"OK\"")
            }

            "getMap" => {
                let (width, height) = match map::render_size(params) {
                    Ok(size) => size,
                    Err(err) => return CommandOutcome::from(&err),
                };
                let snapshot = inner.status.clone();
                drop(inner);
                match map::render(&snapshot, width, height) {
                    Ok(png) => CommandOutcome::png(png),
                    Err(err) => {
                        warn!(device = %self.id, %err, "map render failed");
                        CommandOutcome::from(&CommandError::InvalidValue("map"))
                    }
                }
            }

            _ => {
                let entry = match commands::compile(name, params) {
                    Ok(entry) => entry,
                    Err(err) => return CommandOutcome::from(&err),
                };
                drop(inner);
                debug!(device = %self.id, command = name, "queueing command");
                match connection.enqueue(entry) {
                    Ok(()) => CommandOutcome::ok(),
                    Err(err) => CommandOutcome::from(&err),
                }
            }
        }
    }
}

/// Registry of every device seen since startup. Explicitly constructed and
/// shared by the connection layer and the HTTP collaborator.
pub struct DeviceRegistry {
    config_dir: PathBuf,
    devices: Mutex<HashMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a device, creating it with defaults on first reference.
    pub fn get_or_create(&self, device_id: &str) -> Arc<Device> {
        let mut devices = self.devices.lock();
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Device::new(device_id, &self.config_dir)))
            .clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Entry point for the HTTP collaborator: `target` is a device id or
    /// `"all"`. Unknown ids are an error; devices are only created lazily by
    /// identification or by the vendor-compat data endpoints.
    pub fn send_command(&self, target: &str, name: &str, params: &Params) -> CommandOutcome {
        if target.is_empty() {
            return CommandOutcome::json(1, "\"Missing robot ID\"");
        }
        if target == "all" {
            let devices: Vec<Arc<Device>> = self.devices.lock().values().cloned().collect();
            let mut last = CommandOutcome::ok();
            for device in devices {
                last = device.send_command(name, params);
            }
            return last;
        }
        match self.get(target) {
            Some(device) => device.send_command(name, params),
            None => CommandOutcome::json(2, "\"Invalid robot ID\""),
        }
    }

    /// Vendor-compat HTTP endpoints submit identity/clear-time fields here;
    /// this path does create unseen devices.
    pub fn http_data_update(&self, device_id: &str, fields: &Params) {
        self.get_or_create(device_id).http_data_update(fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, DeviceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path());
        (dir, registry)
    }

    #[test]
    fn test_lazy_creation_and_listing() {
        let (_dir, registry) = registry();
        assert!(registry.list_ids().is_empty());
        registry.get_or_create("beta");
        registry.get_or_create("alpha");
        registry.get_or_create("alpha");
        assert_eq!(registry.list_ids(), ["alpha", "beta"]);
    }

    #[test]
    fn test_send_command_error_taxonomy() {
        let (_dir, registry) = registry();
        let params = Params::new();

        assert_eq!(registry.send_command("", "clean", &params).error, 1);
        assert_eq!(registry.send_command("ghost", "clean", &params).error, 2);

        registry.get_or_create("dev-1");
        // Known but not connected.
        assert_eq!(registry.send_command("dev-1", "clean", &params).error, 3);
    }

    #[test]
    fn test_all_with_no_devices_is_ok() {
        let (_dir, registry) = registry();
        assert_eq!(registry.send_command("all", "clean", &Params::new()).error, 0);
    }

    #[test]
    fn test_http_data_update_creates_device() {
        let (_dir, registry) = registry();
        let fields: Params = [("appKey", "k"), ("deviceType", "1"), ("bogus", "x")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        registry.http_data_update("dev-9", &fields);

        let device = registry.get("dev-9").unwrap();
        let status = device.status_json();
        assert_eq!(status["appKey"], "k");
        assert_eq!(status["deviceType"], "1");
        assert!(status.get("bogus").is_none());
    }
}
