//! Device status cache and work-state codes.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Telemetry fields a device may report; everything else is ignored.
pub const STATUS_KEYS: &[&str] = &[
    "workState",
    "workMode",
    "fan",
    "direction",
    "brush",
    "battery",
    "voice",
    "error",
    "standbyMode",
    "waterTank",
    "clearComponent",
    "waterMark",
    "version",
    "attract",
    "deviceIp",
    "devicePort",
    "cleanGoon",
    "clearArea",
    "clearTime",
    "clearSign",
    "clearModule",
    "isFinish",
    "chargerPos",
    "map",
    "track",
    "errorCode",
    "doTime",
    "appKey",
    "deviceType",
    "authCode",
    "funDefine",
    "nonce_str",
    "sign",
];

/// Work states as the firmware reports them in `workState`. Codes "5" and
/// "7" both mean "now charging"; they map to one variant here, while raw
/// codes stay distinguishable in the status cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Cleaning,
    Stopped,
    Returning,
    Charging,
    Charged,
}

impl WorkState {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "1" => Some(WorkState::Cleaning),
            "2" => Some(WorkState::Stopped),
            "4" => Some(WorkState::Returning),
            "5" | "7" => Some(WorkState::Charging),
            "6" => Some(WorkState::Charged),
            _ => None,
        }
    }
}

/// Target of a `waitState` queue entry. `Home` is an alias matching either
/// the charging or the charged state; everywhere else the two stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTarget {
    Work(WorkState),
    Home,
}

impl StateTarget {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "cleaning" => Some(StateTarget::Work(WorkState::Cleaning)),
            "stopped" => Some(StateTarget::Work(WorkState::Stopped)),
            "returning" => Some(StateTarget::Work(WorkState::Returning)),
            "charging" => Some(StateTarget::Work(WorkState::Charging)),
            "charged" => Some(StateTarget::Work(WorkState::Charged)),
            "home" => Some(StateTarget::Home),
            _ => None,
        }
    }

    pub fn matches(&self, code: &str) -> bool {
        match (self, WorkState::from_code(code)) {
            (StateTarget::Work(want), Some(got)) => *want == got,
            (StateTarget::Home, Some(got)) => {
                got == WorkState::Charging || got == WorkState::Charged
            }
            (_, None) => false,
        }
    }
}

/// Whitelisted key -> value snapshot of the latest telemetry. Every known key
/// exists from the start, initialized to the empty string, and disconnect
/// resets all of them so stale telemetry is never served.
#[derive(Debug, Clone)]
pub struct StatusCache {
    values: BTreeMap<&'static str, String>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            values: STATUS_KEYS.iter().map(|key| (*key, String::new())).collect(),
        }
    }

    pub fn reset(&mut self) {
        for value in self.values.values_mut() {
            value.clear();
        }
    }

    /// Merge a report's `value` object. Only payloads carrying a `noteCmd` or
    /// `transitCmd` marker are telemetry reports; anything else is left
    /// alone. Returns true when something was merged.
    pub fn merge_report(&mut self, value: &Map<String, Value>) -> bool {
        if !value.contains_key("noteCmd") && !value.contains_key("transitCmd") {
            return false;
        }
        for (key, field) in value {
            self.set(key, field_to_string(field));
        }
        true
    }

    /// Store one field if it is whitelisted. Returns whether it was.
    pub fn set(&mut self, key: &str, value: String) -> bool {
        match self.values.get_mut(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn work_state(&self) -> &str {
        self.get("workState").unwrap_or("")
    }

    pub fn battery(&self) -> Option<u8> {
        self.get("battery").and_then(|raw| raw.trim().parse().ok())
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(key, value)| ((*key).to_string(), Value::String(value.clone())))
                .collect(),
        )
    }
}

fn field_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(fields: Value) -> Map<String, Value> {
        fields.as_object().unwrap().clone()
    }

    #[test]
    fn test_all_keys_start_empty() {
        let cache = StatusCache::new();
        for key in STATUS_KEYS {
            assert_eq!(cache.get(key), Some(""));
        }
    }

    #[test]
    fn test_merge_requires_report_marker() {
        let mut cache = StatusCache::new();
        assert!(!cache.merge_report(&report(json!({"workState": "1"}))));
        assert_eq!(cache.work_state(), "");

        assert!(cache.merge_report(&report(json!({"noteCmd": "102", "workState": "1"}))));
        assert_eq!(cache.work_state(), "1");
    }

    #[test]
    fn test_merge_skips_unknown_keys() {
        let mut cache = StatusCache::new();
        cache.merge_report(&report(json!({
            "transitCmd": "110",
            "battery": "77",
            "favouriteColor": "teal"
        })));
        assert_eq!(cache.battery(), Some(77));
        assert_eq!(cache.get("favouriteColor"), None);
    }

    #[test]
    fn test_reset_clears_values() {
        let mut cache = StatusCache::new();
        cache.merge_report(&report(json!({"noteCmd": "102", "battery": "50"})));
        cache.reset();
        assert_eq!(cache.get("battery"), Some(""));
    }

    #[test]
    fn test_work_state_codes() {
        assert_eq!(WorkState::from_code("1"), Some(WorkState::Cleaning));
        assert_eq!(WorkState::from_code("5"), Some(WorkState::Charging));
        assert_eq!(WorkState::from_code("7"), Some(WorkState::Charging));
        assert_eq!(WorkState::from_code("6"), Some(WorkState::Charged));
        assert_eq!(WorkState::from_code("9"), None);
        assert_eq!(WorkState::from_code(""), None);
    }

    #[test]
    fn test_home_alias_matches_charging_and_charged_only() {
        let home = StateTarget::Home;
        assert!(home.matches("5"));
        assert!(home.matches("6"));
        assert!(home.matches("7"));
        for code in ["1", "2", "4", "", "banana"] {
            assert!(!home.matches(code), "home must not match {code:?}");
        }
    }

    #[test]
    fn test_specific_target_keeps_codes_distinct() {
        let charging = StateTarget::Work(WorkState::Charging);
        assert!(charging.matches("5"));
        assert!(!charging.matches("6"));
    }
}
