//! Wire-contract tests: the exact JSON shapes peers see on the socket.
//! Driver frontends and the rover firmware are written against these
//! shapes, so they are pinned here rather than inferred from serde.

use sandshark::protocol::{
    decode, encode, Command, LogLevel, Measurements, Message, ProtocolErrorKind, QueuedCommand,
};
use serde_json::{json, Value};

fn encoded(msg: &Message) -> Value {
    serde_json::from_str(&encode(msg).unwrap()).unwrap()
}

#[test]
fn auth_handshake_shapes() {
    assert_eq!(
        encoded(&Message::Auth {
            token: "alice:hunter2".into()
        }),
        json!({"type": "auth", "token": "alice:hunter2"})
    );
    assert_eq!(
        encoded(&Message::AuthResponse {
            success: true,
            user: Some("alice".into())
        }),
        json!({"type": "auth_response", "success": true, "user": "alice"})
    );
    assert_eq!(
        encoded(&Message::AuthResponse {
            success: false,
            user: None
        }),
        json!({"type": "auth_response", "success": false, "user": null})
    );
}

#[test]
fn command_envelope_nests_the_command_with_its_own_tag() {
    let msg = Message::Command {
        id: 4,
        command: Some(Command::MoveContinuous {
            speed: 0.25,
            angle: -10.0,
        }),
    };
    assert_eq!(
        encoded(&msg),
        json!({
            "type": "command",
            "id": 4,
            "command": {"type": "move_continuous", "speed": 0.25, "angle": -10.0}
        })
    );

    // Cancellation is the same envelope with a null command.
    assert_eq!(
        encoded(&Message::Command {
            id: 4,
            command: None
        }),
        json!({"type": "command", "id": 4, "command": null})
    );
}

#[test]
fn command_ended_carries_the_id_and_outcome() {
    let msg = Message::CommandEnded {
        id: 4,
        command: Command::MoveDistance {
            distance: 1.0,
            speed: 0.5,
            angle: 0.0,
        },
        completed: false,
    };
    let value = encoded(&msg);
    assert_eq!(value["type"], "command_ended");
    assert_eq!(value["id"], 4);
    assert_eq!(value["completed"], false);
    assert_eq!(value["command"]["type"], "move_distance");
}

#[test]
fn queue_status_lists_current_and_queued() {
    let msg = Message::QueueStatus {
        current_command: Some(QueuedCommand {
            id: 1,
            command: Command::MoveContinuous {
                speed: 0.1,
                angle: 0.0,
            },
        }),
        queued_commands: vec![QueuedCommand {
            id: 2,
            command: Command::MoveContinuous {
                speed: 0.2,
                angle: 0.0,
            },
        }],
    };
    let value = encoded(&msg);
    assert_eq!(value["current_command"]["id"], 1);
    assert_eq!(value["queued_commands"][0]["id"], 2);
}

#[test]
fn sensor_data_keeps_unparseable_fields_as_null() {
    let mut measurements = Measurements::new();
    measurements.insert("temp".into(), Some(21.5));
    measurements.insert("humidity".into(), None);
    let msg = Message::SensorData {
        time: 1_700_000_000_000_000_000,
        sensor: "internal_bme".into(),
        measurements,
    };
    assert_eq!(
        encoded(&msg),
        json!({
            "type": "sensor_data",
            "time": 1_700_000_000_000_000_000i64,
            "sensor": "internal_bme",
            "measurements": {"humidity": null, "temp": 21.5}
        })
    );
}

#[test]
fn error_kinds_are_snake_case() {
    let value = encoded(&Message::error(ProtocolErrorKind::IdInUse, "dup"));
    assert_eq!(
        value,
        json!({"type": "error", "error": "id_in_use", "message": "dup"})
    );
    let value = encoded(&Message::error(ProtocolErrorKind::JsonParseError, "bad"));
    assert_eq!(value["error"], "json_parse_error");
}

#[test]
fn messages_from_python_era_peers_still_decode() {
    // Frames captured from the previous frontend, level aliases included.
    let frames = [
        r#"{"type": "log", "message": "hi", "level": "warn"}"#,
        r#"{"type": "e_stop"}"#,
        r#"{"type": "option", "get": ["camera.framerate"], "set": {}}"#,
        r#"{"type": "query_base", "query": "clients"}"#,
        r#"{"type": "point_camera", "yaw": 180, "pitch": 50}"#,
        r#"{"type": "arduino_debug", "message": "m 1 2"}"#,
        r#"{"type": "nmea", "time": 0, "sentence": "$GPGGA,,,,,,0,,,,M,,M,,*66"}"#,
        r#"{"type": "clear_queue"}"#,
    ];
    for frame in frames {
        decode(frame).unwrap_or_else(|e| panic!("{frame}: {e}"));
    }
}

#[test]
fn log_levels_round_trip_canonically() {
    let value = encoded(&Message::log("m", LogLevel::Critical));
    assert_eq!(value["level"], "critical");
    let value = encoded(&Message::log("m", LogLevel::Warning));
    assert_eq!(value["level"], "warning");
}
