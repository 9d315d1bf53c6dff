//! Durable per-device configuration.
//!
//! A flat string key -> value store, one JSON file per device id, surviving
//! process restarts. Writes go through a temp file and an atomic rename so a
//! failure mid-write never leaves a torn file behind.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Seeded once when a device is first seen: default fan level, water level,
/// cleaning-mode index, and the battery-guard tunables (enabled flag,
/// trigger threshold in percent, consecutive-trigger count).
pub const DEFAULTS: &[(&str, &str)] = &[
    ("fan", "2"),
    ("water", "0"),
    ("mode", "0"),
    ("guard", "1"),
    ("guardLevel", "80"),
    ("guardTimes", "3"),
];

#[derive(Debug)]
pub struct Settings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Load the store for a device, seeding defaults for missing keys.
    pub fn load(config_dir: &Path, device_id: &str) -> Self {
        let path = config_dir.join(format!("device_{device_id}.json"));
        let mut values: BTreeMap<String, String> = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), %err, "unreadable settings file, starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        for (key, value) in DEFAULTS {
            values
                .entry((*key).to_string())
                .or_insert_with(|| (*value).to_string());
        }
        Self { path, values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Store a value and write the file through before returning.
    pub fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.persist()
    }

    fn persist(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&self.values)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }

    // Typed accessors for the guard tunables; unparsable stored values fall
    // back to the seeded defaults.

    pub fn guard_enabled(&self) -> bool {
        !matches!(self.get("guard"), Some("0") | Some("false"))
    }

    pub fn guard_level(&self) -> u8 {
        self.get("guardLevel").and_then(|v| v.parse().ok()).unwrap_or(80)
    }

    pub fn guard_times(&self) -> u32 {
        self.get("guardTimes").and_then(|v| v.parse().ok()).unwrap_or(3)
    }

    pub fn fan(&self) -> String {
        self.get("fan").unwrap_or("2").to_string()
    }

    pub fn water(&self) -> String {
        self.get("water").unwrap_or("0").to_string()
    }

    pub fn mode_index(&self) -> usize {
        self.get("mode").and_then(|v| v.parse().ok()).unwrap_or(0)
    }
}
