//! Wire protocol shared by the base station and the rover.
//!
//! Every frame on the driver/rover link is one UTF-8 JSON object with a
//! `type` discriminator. Decoding either yields exactly one [`Message`]
//! variant or fails with a [`DecodeError`]; unknown tags, missing fields
//! and type mismatches are all rejected the same way. Extra fields are
//! tolerated so firmware can grow its payloads without breaking older
//! peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Sensor measurements keyed by field name. A `None` value means the
/// field was present on the wire but unparseable.
pub type Measurements = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Driver,
    Rover,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Driver => "driver",
            Role::Rover => "rover",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log severity carried on `log` messages and microcontroller `log` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
    #[serde(alias = "fatal")]
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// Lenient parse used for levels coming off the serial line.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "critical" | "fatal" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

/// Error kinds reported back to a peer on an `error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolErrorKind {
    JsonParseError,
    InvalidMessage,
    IdInUse,
    UnknownId,
}

/// A rover action. Each variant owns its fixed single-line ASCII encoding
/// for the microcontroller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Move a set distance at the given speed, turning `angle` over it.
    MoveDistance { distance: f64, speed: f64, angle: f64 },
    /// Move continuously at the given speed while turning at `angle`.
    MoveContinuous { speed: f64, angle: f64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::MoveDistance { .. } => "move_distance",
            Command::MoveContinuous { .. } => "move_continuous",
        }
    }

    /// The newline-terminated line written to the microcontroller.
    pub fn to_serial_line(&self) -> String {
        match self {
            Command::MoveDistance {
                distance,
                speed,
                angle,
            } => format!("d{distance} {speed} {angle}\n"),
            Command::MoveContinuous { speed, angle } => format!("c{speed} {angle}\n"),
        }
    }
}

/// A command known to the base station's correlation queue, as exposed to
/// drivers on `queue_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub id: i64,
    pub command: Command,
}

/// The message envelope. One frame per message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message on every connection: authenticates the client.
    Auth { token: String },
    AuthResponse {
        success: bool,
        user: Option<String>,
    },
    Log {
        message: String,
        level: LogLevel,
    },
    /// Sets the rover's current command. A `null` command cancels the
    /// active one without starting a new one.
    Command {
        id: i64,
        command: Option<Command>,
    },
    /// The command with this id has finished, successfully or not.
    CommandEnded {
        id: i64,
        command: Command,
        completed: bool,
    },
    /// Notifies of the currently running command.
    CommandStatus { command: Option<Command> },
    /// Drains all queued-but-not-dispatched commands.
    ClearQueue,
    QueueStatus {
        current_command: Option<QueuedCommand>,
        queued_commands: Vec<QueuedCommand>,
    },
    Error {
        error: ProtocolErrorKind,
        message: String,
    },
    /// Emergency stop. Bypasses role and queue checks.
    EStop,
    /// Gets and/or sets rover options.
    Option {
        get: Vec<String>,
        set: serde_json::Map<String, Value>,
    },
    OptionResponse {
        values: serde_json::Map<String, Value>,
    },
    SensorData {
        /// System timestamp in nanoseconds.
        time: i64,
        sensor: String,
        measurements: Measurements,
    },
    /// A raw NMEA sentence, forwarded verbatim for archival.
    Nmea { time: i64, sentence: String },
    /// Retrieves a value from the base station.
    QueryBase { query: String },
    QueryBaseResponse { query: String, value: Value },
    PointCamera {
        yaw: i32,
        pitch: i32,
        #[serde(default)]
        relative: bool,
    },
    /// Raw line passed through to the microcontroller verbatim.
    ArduinoDebug { message: String },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthResponse { .. } => "auth_response",
            Message::Log { .. } => "log",
            Message::Command { .. } => "command",
            Message::CommandEnded { .. } => "command_ended",
            Message::CommandStatus { .. } => "command_status",
            Message::ClearQueue => "clear_queue",
            Message::QueueStatus { .. } => "queue_status",
            Message::Error { .. } => "error",
            Message::EStop => "e_stop",
            Message::Option { .. } => "option",
            Message::OptionResponse { .. } => "option_response",
            Message::SensorData { .. } => "sensor_data",
            Message::Nmea { .. } => "nmea",
            Message::QueryBase { .. } => "query_base",
            Message::QueryBaseResponse { .. } => "query_base_response",
            Message::PointCamera { .. } => "point_camera",
            Message::ArduinoDebug { .. } => "arduino_debug",
        }
    }

    pub fn log(message: impl Into<String>, level: LogLevel) -> Self {
        Message::Log {
            message: message.into(),
            level,
        }
    }

    pub fn error(error: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Message::Error {
            error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Decodes one wire frame. Fails closed: any envelope, tag or field
/// problem is the same [`DecodeError`].
pub fn decode(raw: &str) -> Result<Message, DecodeError> {
    Ok(serde_json::from_str(raw)?)
}

/// Encodes a message to one wire frame.
pub fn encode(msg: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_dispatches_on_tag() {
        let msg = decode(r#"{"type":"e_stop"}"#).unwrap();
        assert_eq!(msg, Message::EStop);

        let msg = decode(r#"{"type":"auth","token":"user:secret"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Auth {
                token: "user:secret".into()
            }
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(decode(r#"{"type":"warp_drive"}"#).is_err());
    }

    #[test]
    fn missing_field_is_an_error() {
        assert!(decode(r#"{"type":"log","message":"hi"}"#).is_err());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        assert!(decode(r#"{"type":"log","message":"hi","level":5}"#).is_err());
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let msg = decode(r#"{"type":"e_stop","reason":"operator"}"#).unwrap();
        assert_eq!(msg, Message::EStop);
    }

    #[test]
    fn command_nests_with_its_own_tag() {
        let raw = json!({
            "type": "command",
            "id": 1,
            "command": {
                "type": "move_distance",
                "distance": 1.0,
                "speed": 0.5,
                "angle": 0.0
            }
        });
        let msg = decode(&raw.to_string()).unwrap();
        assert_eq!(
            msg,
            Message::Command {
                id: 1,
                command: Some(Command::MoveDistance {
                    distance: 1.0,
                    speed: 0.5,
                    angle: 0.0
                })
            }
        );
    }

    #[test]
    fn null_command_decodes() {
        let msg = decode(r#"{"type":"command","id":7,"command":null}"#).unwrap();
        assert_eq!(
            msg,
            Message::Command {
                id: 7,
                command: None
            }
        );
    }

    #[test]
    fn serial_line_encoding() {
        let cmd = Command::MoveDistance {
            distance: 1.5,
            speed: 0.5,
            angle: 0.0,
        };
        assert_eq!(cmd.to_serial_line(), "d1.5 0.5 0\n");

        let cmd = Command::MoveContinuous {
            speed: 0.25,
            angle: -10.0,
        };
        assert_eq!(cmd.to_serial_line(), "c0.25 -10\n");
    }

    #[test]
    fn log_level_aliases() {
        let msg = decode(r#"{"type":"log","message":"m","level":"warn"}"#).unwrap();
        assert_eq!(msg, Message::log("m", LogLevel::Warning));
        assert_eq!(LogLevel::parse_lenient("FATAL"), Some(LogLevel::Critical));
        assert_eq!(LogLevel::parse_lenient("loud"), None);
    }

    #[test]
    fn point_camera_relative_defaults_false() {
        let msg = decode(r#"{"type":"point_camera","yaw":90,"pitch":45}"#).unwrap();
        assert_eq!(
            msg,
            Message::PointCamera {
                yaw: 90,
                pitch: 45,
                relative: false
            }
        );
    }
}
