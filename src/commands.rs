//! Command vocabulary and queue-entry types.
//!
//! Everything a caller can ask a robot to do is validated here, before any
//! wire traffic exists. An invalid name or parameter is rejected
//! synchronously; only well-formed entries ever reach a connection's queue.

use std::collections::HashMap;

use thiserror::Error;

use crate::status::StateTarget;

/// HTTP-style string parameters, as the companion app submits them.
pub type Params = HashMap<String, String>;

/// Rejection reasons, carrying the numeric codes surfaced to HTTP callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Robot is not connected")]
    NotConnected,

    #[error("Not identified")]
    NotIdentified,

    #[error("Unknown command {0}")]
    UnknownCommand(String),

    #[error("Missing parameter ({0})")]
    MissingParameter(&'static str),

    #[error("Invalid value ({0})")]
    InvalidValue(&'static str),

    #[error("Key {0} does not exist in persistent data")]
    UnknownKey(String),
}

impl CommandError {
    pub fn code(&self) -> u8 {
        match self {
            CommandError::NotConnected => 3,
            CommandError::NotIdentified => 4,
            CommandError::UnknownCommand(_) => 5,
            CommandError::MissingParameter(_) => 6,
            CommandError::InvalidValue(_) => 7,
            CommandError::UnknownKey(_) => 8,
        }
    }
}

/// Manual-drive directions, wire values 0-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stop,
    Forward,
    Backward,
    TurnLeft,
    TurnRight,
}

impl Direction {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "0" => Some(Direction::Stop),
            "1" => Some(Direction::Forward),
            "2" => Some(Direction::Backward),
            "3" => Some(Direction::TurnLeft),
            "4" => Some(Direction::TurnRight),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Direction::Stop => "0",
            Direction::Forward => "1",
            Direction::Backward => "2",
            Direction::TurnLeft => "3",
            Direction::TurnRight => "4",
        }
    }
}

/// An ordinary numbered command, ready for the outbound envelope. `prefix`
/// and `suffix` are extra `value` fields placed before/after `transitCmd`,
/// matching where the vendor firmware saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitCommand {
    pub name: &'static str,
    pub code: u16,
    pub prefix: Option<(&'static str, String)>,
    pub suffix: Option<(&'static str, String)>,
    pub needs_ack: bool,
}

impl TransitCommand {
    pub fn simple(name: &'static str, code: u16, needs_ack: bool) -> Self {
        Self {
            name,
            code,
            prefix: None,
            suffix: None,
            needs_ack,
        }
    }
}

/// One pending entry in a connection's command queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    /// Numbered command for the robot, optionally waiting for its ack.
    Transit(TransitCommand),
    /// Suspend queue progress for a fixed duration.
    Wait { seconds: u64 },
    /// Suspend queue progress until the reported work state matches.
    WaitForState { target: StateTarget },
    /// Manual-drive direction; routed to the drive loop, not the FIFO.
    Drive { direction: Direction },
}

fn require<'p>(params: &'p Params, key: &'static str) -> Result<&'p str, CommandError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or(CommandError::MissingParameter(key))
}

/// Translate a command name plus parameters into a queue entry.
///
/// Fan level 110: off=1, eco=4, normal=2, turbo=3. Water level 145: off=255,
/// small=60, normal=40, fast=20. Cleaning mode 106: auto=11, gyro=1,
/// random=3, borders=4, area=6, x2=8, scrub=10.
pub fn compile(name: &str, params: &Params) -> Result<QueueEntry, CommandError> {
    let entry = match name {
        "clean" => QueueEntry::Transit(TransitCommand::simple("clean", 100, true)),
        "stop" => QueueEntry::Transit(TransitCommand::simple("stop", 102, true)),
        "return" => QueueEntry::Transit(TransitCommand::simple("return", 104, true)),
        "updateMap" => QueueEntry::Transit(TransitCommand::simple("updateMap", 131, true)),
        "askStatus" => QueueEntry::Transit(TransitCommand::simple("askStatus", 98, false)),
        "notifyConnection" => {
            QueueEntry::Transit(TransitCommand::simple("notifyConnection", 400, false))
        }

        "sound" => {
            let code = match require(params, "status")? {
                "0" => 125,
                "1" => 123,
                _ => return Err(CommandError::InvalidValue("status")),
            };
            QueueEntry::Transit(TransitCommand::simple("sound", code, true))
        }

        "fan" => {
            let level = match require(params, "speed")? {
                "0" => "1",
                "1" => "4",
                "2" => "2",
                "3" => "3",
                _ => return Err(CommandError::InvalidValue("speed")),
            };
            QueueEntry::Transit(TransitCommand {
                name: "fan",
                code: 110,
                prefix: Some(("fan", level.to_string())),
                suffix: None,
                needs_ack: true,
            })
        }

        "watertank" => {
            let level = match require(params, "speed")? {
                "0" => "255",
                "1" => "60",
                "2" => "40",
                "3" => "20",
                _ => return Err(CommandError::InvalidValue("speed")),
            };
            QueueEntry::Transit(TransitCommand {
                name: "watertank",
                code: 145,
                prefix: None,
                suffix: Some(("waterTank", level.to_string())),
                needs_ack: true,
            })
        }

        "mode" => {
            let mode = match require(params, "type")? {
                "auto" => "11",
                "gyro" => "1",
                "random" => "3",
                "borders" => "4",
                "area" => "6",
                "x2" => "8",
                "scrub" => "10",
                _ => return Err(CommandError::InvalidValue("type")),
            };
            QueueEntry::Transit(TransitCommand {
                name: "mode",
                code: 106,
                prefix: Some(("mode", mode.to_string())),
                suffix: None,
                needs_ack: true,
            })
        }

        "manual" => {
            let direction = Direction::from_param(require(params, "direction")?)
                .ok_or(CommandError::InvalidValue("direction"))?;
            QueueEntry::Drive { direction }
        }

        "wait" => {
            let seconds = require(params, "seconds")?
                .parse::<u64>()
                .map_err(|_| CommandError::InvalidValue("seconds"))?;
            QueueEntry::Wait { seconds }
        }

        "waitState" => {
            let target = StateTarget::from_param(require(params, "state")?)
                .ok_or(CommandError::InvalidValue("state"))?;
            QueueEntry::WaitForState { target }
        }

        other => return Err(CommandError::UnknownCommand(other.to_string())),
    };
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::WorkState;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_commands() {
        let empty = Params::new();
        for (name, code) in [("clean", 100), ("stop", 102), ("return", 104), ("updateMap", 131)] {
            match compile(name, &empty).unwrap() {
                QueueEntry::Transit(cmd) => {
                    assert_eq!(cmd.code, code);
                    assert!(cmd.needs_ack);
                    assert!(cmd.prefix.is_none() && cmd.suffix.is_none());
                }
                other => panic!("expected transit entry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_fire_and_forget_commands() {
        let empty = Params::new();
        for (name, code) in [("askStatus", 98), ("notifyConnection", 400)] {
            match compile(name, &empty).unwrap() {
                QueueEntry::Transit(cmd) => {
                    assert_eq!(cmd.code, code);
                    assert!(!cmd.needs_ack);
                }
                other => panic!("expected transit entry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_fan_levels() {
        for (speed, level) in [("0", "1"), ("1", "4"), ("2", "2"), ("3", "3")] {
            match compile("fan", &params(&[("speed", speed)])).unwrap() {
                QueueEntry::Transit(cmd) => {
                    assert_eq!(cmd.code, 110);
                    assert_eq!(cmd.prefix, Some(("fan", level.to_string())));
                }
                other => panic!("expected transit entry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_fan_out_of_range() {
        let err = compile("fan", &params(&[("speed", "9")])).unwrap_err();
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn test_watertank_levels() {
        for (speed, level) in [("0", "255"), ("1", "60"), ("2", "40"), ("3", "20")] {
            match compile("watertank", &params(&[("speed", speed)])).unwrap() {
                QueueEntry::Transit(cmd) => {
                    assert_eq!(cmd.code, 145);
                    assert_eq!(cmd.suffix, Some(("waterTank", level.to_string())));
                }
                other => panic!("expected transit entry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_mode_values() {
        let table = [
            ("auto", "11"),
            ("gyro", "1"),
            ("random", "3"),
            ("borders", "4"),
            ("area", "6"),
            ("x2", "8"),
            ("scrub", "10"),
        ];
        for (kind, mode) in table {
            match compile("mode", &params(&[("type", kind)])).unwrap() {
                QueueEntry::Transit(cmd) => {
                    assert_eq!(cmd.code, 106);
                    assert_eq!(cmd.prefix, Some(("mode", mode.to_string())));
                }
                other => panic!("expected transit entry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_sound_values() {
        match compile("sound", &params(&[("status", "0")])).unwrap() {
            QueueEntry::Transit(cmd) => assert_eq!(cmd.code, 125),
            other => panic!("expected transit entry, got {other:?}"),
        }
        match compile("sound", &params(&[("status", "1")])).unwrap() {
            QueueEntry::Transit(cmd) => assert_eq!(cmd.code, 123),
            other => panic!("expected transit entry, got {other:?}"),
        }
        assert_eq!(
            compile("sound", &params(&[("status", "2")])).unwrap_err().code(),
            7
        );
    }

    #[test]
    fn test_missing_parameters() {
        let empty = Params::new();
        for name in ["sound", "fan", "watertank", "mode", "manual", "wait", "waitState"] {
            let err = compile(name, &empty).unwrap_err();
            assert_eq!(err.code(), 6, "{name} should require a parameter");
        }
    }

    #[test]
    fn test_unknown_command() {
        let err = compile("levitate", &Params::new()).unwrap_err();
        assert_eq!(err.code(), 5);
    }

    #[test]
    fn test_wait_entries() {
        match compile("wait", &params(&[("seconds", "4")])).unwrap() {
            QueueEntry::Wait { seconds } => assert_eq!(seconds, 4),
            other => panic!("expected wait entry, got {other:?}"),
        }
        assert_eq!(
            compile("wait", &params(&[("seconds", "soon")])).unwrap_err().code(),
            7
        );
    }

    #[test]
    fn test_wait_state_targets() {
        match compile("waitState", &params(&[("state", "cleaning")])).unwrap() {
            QueueEntry::WaitForState { target } => {
                assert_eq!(target, StateTarget::Work(WorkState::Cleaning));
            }
            other => panic!("expected wait-for-state entry, got {other:?}"),
        }
        match compile("waitState", &params(&[("state", "home")])).unwrap() {
            QueueEntry::WaitForState { target } => assert_eq!(target, StateTarget::Home),
            other => panic!("expected wait-for-state entry, got {other:?}"),
        }
        assert_eq!(
            compile("waitState", &params(&[("state", "parked")]))
                .unwrap_err()
                .code(),
            7
        );
    }

    #[test]
    fn test_manual_directions() {
        match compile("manual", &params(&[("direction", "3")])).unwrap() {
            QueueEntry::Drive { direction } => assert_eq!(direction, Direction::TurnLeft),
            other => panic!("expected drive entry, got {other:?}"),
        }
        assert_eq!(
            compile("manual", &params(&[("direction", "7")]))
                .unwrap_err()
                .code(),
            7
        );
    }
}
