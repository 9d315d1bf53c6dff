//! Battery guard: stuck-dock detection and recovery.
//!
//! Rapid charge/discharge cycling near a low threshold is the signature of a
//! dock whose charging contacts are not seating. The guard watches work-state
//! transitions (never a timer): each charged -> charging flip with the battery
//! at or under the configured level counts one bad recharge cycle, and after
//! enough consecutive cycles a short cleaning burst plus a fresh return
//! attempt is queued to re-seat the robot.

use crate::commands::Params;
use crate::status::WorkState;

/// Guard tunables, read from the device's persistent settings at evaluation
/// time so property changes take effect immediately.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    pub enabled: bool,
    pub level: u8,
    pub times: u32,
}

/// Transition-driven counter state. Lives next to the device's status cache;
/// one instance per device.
#[derive(Debug, Default)]
pub struct BatteryGuard {
    previous: Option<WorkState>,
    consecutive: u32,
}

impl BatteryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one observed (workState, battery) pair. Returns true when the
    /// recovery sequence should fire; the counter restarts afterwards.
    pub fn observe(&mut self, work_state: &str, battery: Option<u8>, config: GuardConfig) -> bool {
        let Some(state) = WorkState::from_code(work_state) else {
            self.previous = None;
            self.consecutive = 0;
            return false;
        };
        let previous = self.previous.replace(state);
        if previous == Some(state) {
            // Same state re-reported; only transitions count.
            return false;
        }

        let battery_low = battery.is_some_and(|b| b <= config.level);
        match (previous, state) {
            (Some(WorkState::Charged), WorkState::Charging) if battery_low => {
                self.consecutive += 1;
            }
            // The recharge half of a cycle; keep the count.
            (Some(WorkState::Charging), WorkState::Charged) => {}
            _ => self.consecutive = 0,
        }

        if config.enabled && self.consecutive >= config.times {
            self.consecutive = 0;
            return true;
        }
        false
    }

    /// Forget everything observed so far (`resetBattery`, disconnect).
    pub fn reset(&mut self) {
        self.previous = None;
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

fn step(name: &'static str, pairs: &[(&str, &str)]) -> (&'static str, Params) {
    let params = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    (name, params)
}

/// The field-tested recovery: probe twice, strip fan and water, run a short
/// cleaning burst, restore the persisted levels, then try the dock again.
/// `fan` and `water` are the device's persisted speed settings (0-3 scale).
pub fn recovery_sequence(fan: &str, water: &str) -> Vec<(&'static str, Params)> {
    vec![
        step("askStatus", &[]),
        step("wait", &[("seconds", "1")]),
        step("askStatus", &[]),
        step("fan", &[("speed", "0")]),
        step("watertank", &[("speed", "0")]),
        step("clean", &[]),
        step("waitState", &[("state", "cleaning")]),
        step("wait", &[("seconds", "4")]),
        step("stop", &[]),
        step("wait", &[("seconds", "1")]),
        step("fan", &[("speed", fan)]),
        step("watertank", &[("speed", water)]),
        step("waitState", &[("state", "stopped")]),
        step("return", &[]),
        step("waitState", &[("state", "home")]),
    ]
}
