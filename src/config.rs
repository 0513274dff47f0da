use std::env;

/// Shared retry backoff for every resilient link (broker session, serial
/// session, GPS session).
pub const RECONNECT_DELAY_SECS: u64 = 5;

#[derive(Clone, Debug)]
pub struct StationConfig {
    /// Listen address for the WebSocket server.
    pub bind_addr: String,
    /// When false, any token authenticates as an anonymous user.
    pub require_auth: bool,
    /// Path to the userbase JSON file written by the user-management CLI.
    pub userbase_path: String,
    /// Telemetry output directory; `None` disables persistence.
    pub data_dir: Option<String>,
    /// Broadcast e_stop to rovers when the last driver disconnects.
    pub estop_on_driver_loss: bool,
}

impl StationConfig {
    pub fn from_env() -> Self {
        StationConfig {
            bind_addr: env::var("STATION_BIND").unwrap_or_else(|_| "0.0.0.0:11571".to_string()),
            require_auth: env_bool("STATION_REQUIRE_AUTH", true),
            userbase_path: env::var("STATION_USERBASE")
                .unwrap_or_else(|_| "rover_users.json".to_string()),
            data_dir: match env::var("STATION_DATA_DIR") {
                Ok(dir) if dir.is_empty() => None,
                Ok(dir) => Some(dir),
                Err(_) => Some("data".to_string()),
            },
            estop_on_driver_loss: env_bool("STATION_ESTOP_ON_DRIVER_LOSS", true),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        StationConfig {
            bind_addr: "0.0.0.0:11571".to_string(),
            require_auth: true,
            userbase_path: "rover_users.json".to_string(),
            data_dir: Some("data".to_string()),
            estop_on_driver_loss: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoverConfig {
    /// Base station WebSocket URL, including the /rover path.
    pub station_url: String,
    /// Bearer token sent on the auth handshake (`user:secret`).
    pub token: String,
    /// Microcontroller serial device.
    pub serial_port: String,
    pub serial_baud: u32,
    /// GPS receiver serial device (NMEA output).
    pub gps_port: String,
    pub gps_baud: u32,
    /// Control port for the one-shot GPS enable write; `None` skips it.
    pub gps_control_port: Option<String>,
    /// Path to the camera streamer executable.
    pub camera_streamer: String,
}

impl RoverConfig {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(RoverConfig {
            station_url: env::var("ROVER_STATION_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:11571/rover".to_string()),
            token: env::var("ROVER_TOKEN")?,
            serial_port: env::var("ROVER_SERIAL_PORT")
                .unwrap_or_else(|_| "/dev/ttyS0".to_string()),
            serial_baud: env_u32("ROVER_SERIAL_BAUD", 115_200),
            gps_port: env::var("ROVER_GPS_PORT").unwrap_or_else(|_| "/dev/ttyUSB1".to_string()),
            gps_baud: env_u32("ROVER_GPS_BAUD", 115_200),
            gps_control_port: match env::var("ROVER_GPS_CONTROL_PORT") {
                Ok(port) if port.is_empty() => None,
                Ok(port) => Some(port),
                Err(_) => Some("/dev/ttyUSB2".to_string()),
            },
            camera_streamer: env::var("ROVER_CAMERA_STREAMER")
                .unwrap_or_else(|_| "camera-streamer".to_string()),
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
