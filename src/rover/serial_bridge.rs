//! Line-protocol session to the microcontroller.
//!
//! The link is newline-terminated ASCII: the first whitespace-delimited
//! token of each inbound line is the message kind. Outbound, each command
//! variant encodes to one fixed-format line; cancellation is the sentinel
//! line `x`, emergency stop is `!`, and the bridge writes its own
//! heartbeat line `h` every 500ms while watching for `hb` replies.
//!
//! The bridge reconnects on its own 5s backoff, independent of the broker
//! session: a serial failure never tears the upstream link down, and vice
//! versa. At most one command is in flight; submitting another cancels
//! the active one first.

use super::{now_ns, Upstream};
use crate::config::RECONNECT_DELAY_SECS;
use crate::protocol::{Command, LogLevel, Measurements, Message};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_serial::SerialPortBuilderExt;

/// How often the bridge writes its own heartbeat line.
const HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);
/// How long without an `hb` reply before the watchdog warns.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

const CANCEL_LINE: &[u8] = b"x\n";
const ESTOP_LINE: &[u8] = b"!\n";
const HEARTBEAT_LINE: &[u8] = b"h\n";

#[derive(Debug, Clone)]
struct ActiveCommand {
    id: i64,
    command: Command,
}

struct BridgeInner {
    /// Write half of the serial stream; `None` while disconnected. Single
    /// owner: all transmits go through this lock, so no two commands can
    /// interleave bytes.
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    active: Option<ActiveCommand>,
    camera_yaw: i32,
    camera_pitch: i32,
}

pub struct SerialBridge {
    upstream: Upstream,
    port: String,
    baud: u32,
    inner: Mutex<BridgeInner>,
    last_heartbeat: std::sync::Mutex<Instant>,
}

impl SerialBridge {
    pub fn new(upstream: Upstream, port: impl Into<String>, baud: u32) -> Arc<Self> {
        Arc::new(SerialBridge {
            upstream,
            port: port.into(),
            baud,
            inner: Mutex::new(BridgeInner {
                writer: None,
                active: None,
                camera_yaw: 0,
                camera_pitch: 90,
            }),
            last_heartbeat: std::sync::Mutex::new(Instant::now()),
        })
    }

    /// Reconnecting read loop. Runs for the life of the process.
    pub async fn run(self: Arc<Self>) {
        loop {
            match tokio_serial::new(&self.port, self.baud).open_native_async() {
                Ok(stream) => {
                    tracing::info!(port = %self.port, baud = self.baud, "Opened microcontroller serial port");
                    let (read_half, write_half) = tokio::io::split(stream);
                    self.inner.lock().await.writer = Some(Box::new(write_half));

                    let mut lines = BufReader::new(read_half).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => self.handle_line(&line).await,
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(error = %e, "Serial read failed");
                                break;
                            }
                        }
                    }

                    let orphaned = {
                        let mut inner = self.inner.lock().await;
                        inner.writer = None;
                        inner.active.take()
                    };
                    // The restarted microcontroller will never report this
                    // command, so end it now to free its id.
                    match orphaned {
                        Some(active) => {
                            self.upstream.log(
                                LogLevel::Error,
                                format!(
                                    "Disconnected from microcontroller with command {} (#{}) in flight, reconnecting in {RECONNECT_DELAY_SECS} seconds",
                                    active.command.name(),
                                    active.id
                                ),
                            );
                            self.upstream.send(Message::CommandEnded {
                                id: active.id,
                                command: active.command,
                                completed: false,
                            });
                        }
                        None => self.upstream.log(
                            LogLevel::Error,
                            format!(
                                "Disconnected from microcontroller, reconnecting in {RECONNECT_DELAY_SECS} seconds"
                            ),
                        ),
                    }
                }
                Err(e) => {
                    tracing::error!(port = %self.port, error = %e, "Unable to open microcontroller serial port");
                }
            }
            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    }

    /// Heartbeat timer: proactively writes `h` and warns when the
    /// microcontroller stops answering. Liveness only, not request/response.
    pub async fn run_heartbeat(self: Arc<Self>) {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.writer.is_some() {
                    self.write_locked(&mut inner, HEARTBEAT_LINE).await;
                }
            }
            let stale = self
                .last_heartbeat
                .lock()
                .map(|last| last.elapsed() > HEARTBEAT_TIMEOUT)
                .unwrap_or(false);
            if stale {
                self.upstream.log(
                    LogLevel::Warning,
                    "Microcontroller is not replying to heartbeats",
                );
            }
            tokio::time::sleep(HEARTBEAT_PERIOD).await;
        }
    }

    /// Sets the current command, cancelling any active one first. The
    /// cancelled command's `command_ended` is emitted before its cancel
    /// line is written. A `None` command cancels without replacement.
    pub async fn submit(&self, id: i64, command: Option<Command>) {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none() {
            self.upstream.log(
                LogLevel::Error,
                "Could not set command because the microcontroller is not connected",
            );
            return;
        }
        self.cancel_locked(&mut inner).await;
        match command {
            Some(command) => {
                self.write_locked(&mut inner, command.to_serial_line().as_bytes())
                    .await;
                inner.active = Some(ActiveCommand {
                    id,
                    command: command.clone(),
                });
                self.upstream.send(Message::CommandStatus {
                    command: Some(command),
                });
            }
            None => {
                self.upstream.send(Message::CommandStatus { command: None });
            }
        }
    }

    /// Cancels the active command, if any. Used on upstream disconnect.
    pub async fn cancel_active(&self) {
        let mut inner = self.inner.lock().await;
        if inner.active.is_none() {
            return;
        }
        if inner.writer.is_none() {
            self.upstream.log(
                LogLevel::Error,
                "Could not cancel current command because the microcontroller is not connected",
            );
            return;
        }
        self.cancel_locked(&mut inner).await;
    }

    /// Emergency stop: halts motors immediately and ends the active
    /// command uncompleted.
    pub async fn e_stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_some() {
            self.write_locked(&mut inner, ESTOP_LINE).await;
        } else {
            self.upstream.log(
                LogLevel::Error,
                "Could not handle e-stop because the microcontroller is not connected",
            );
        }
        if let Some(active) = inner.active.take() {
            self.upstream.send(Message::CommandEnded {
                id: active.id,
                command: active.command,
                completed: false,
            });
        }
    }

    /// Points the camera. Relative moves add to the current direction;
    /// yaw wraps to [0, 360), pitch clamps to [0, 100].
    pub async fn point_camera(&self, yaw: i32, pitch: i32, relative: bool) {
        let mut inner = self.inner.lock().await;
        // Widened arithmetic: offsets are driver-supplied and may be any i32.
        let (yaw, pitch) = if relative {
            (
                i64::from(inner.camera_yaw) + i64::from(yaw),
                i64::from(inner.camera_pitch) + i64::from(pitch),
            )
        } else {
            (i64::from(yaw), i64::from(pitch))
        };
        inner.camera_yaw = yaw.rem_euclid(360) as i32;
        inner.camera_pitch = pitch.clamp(0, 100) as i32;

        if inner.writer.is_none() {
            self.upstream.log(
                LogLevel::Error,
                "Unable to point camera because the microcontroller is not connected",
            );
            return;
        }
        let line = format!("p{} {}\n", inner.camera_yaw, inner.camera_pitch);
        self.write_locked(&mut inner, line.as_bytes()).await;
    }

    /// Passes a raw debug line through verbatim.
    pub async fn write_raw(&self, message: &str) {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none() {
            self.upstream.log(
                LogLevel::Error,
                "Unable to send debug message because the microcontroller is not connected",
            );
            return;
        }
        let line = format!("{message}\n");
        self.write_locked(&mut inner, line.as_bytes()).await;
    }

    async fn cancel_locked(&self, inner: &mut BridgeInner) {
        if let Some(active) = inner.active.take() {
            self.upstream.send(Message::CommandEnded {
                id: active.id,
                command: active.command,
                completed: false,
            });
            self.write_locked(inner, CANCEL_LINE).await;
        }
    }

    async fn write_locked(&self, inner: &mut BridgeInner, bytes: &[u8]) {
        let result = match inner.writer.as_mut() {
            Some(writer) => writer.write_all(bytes).await,
            None => return,
        };
        if let Err(e) = result {
            // The read loop will notice and reconnect; stop writing now.
            inner.writer = None;
            tracing::error!(error = %e, "Serial write failed");
        }
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let (kind, rest) = match line.split_once(char::is_whitespace) {
            Some((kind, rest)) => (kind, rest.trim()),
            None => (line, ""),
        };

        match kind {
            "hb" => {
                if let Ok(mut last) = self.last_heartbeat.lock() {
                    *last = Instant::now();
                }
            }
            "echo" => {
                self.upstream.log(
                    LogLevel::Info,
                    format!("Received echo from microcontroller: {rest}"),
                );
            }
            "log" => {
                let (level_raw, text) = match rest.split_once(char::is_whitespace) {
                    Some((level, text)) => (level, text.trim()),
                    None => (rest, ""),
                };
                let level = LogLevel::parse_lenient(level_raw).unwrap_or(LogLevel::Info);
                self.upstream
                    .log(level, format!("Microcontroller: {text}"));
            }
            "completed" => {
                let ended = self.inner.lock().await.active.take();
                match ended {
                    Some(active) => self.upstream.send(Message::CommandEnded {
                        id: active.id,
                        command: active.command,
                        completed: true,
                    }),
                    None => self.upstream.log(
                        LogLevel::Warning,
                        "Microcontroller reported completion with no command active",
                    ),
                }
            }
            "data" => {
                let (sensor, fields_raw) = match rest.split_once(char::is_whitespace) {
                    Some((sensor, fields)) => (sensor, fields),
                    None => (rest, ""),
                };
                let fields: Vec<&str> = fields_raw.split_whitespace().collect();
                match decode_sensor_fields(sensor, &fields) {
                    Some(measurements) => self.upstream.send(Message::SensorData {
                        time: now_ns(),
                        sensor: sensor.to_string(),
                        measurements,
                    }),
                    None => self.upstream.log(
                        LogLevel::Error,
                        format!("Received unknown sensor data from microcontroller: {sensor}"),
                    ),
                }
            }
            _ => {
                self.upstream.log(
                    LogLevel::Error,
                    format!("Received unexpected message from microcontroller: {line}"),
                );
            }
        }
    }
}

/// Positionally decodes a `data` line's fields per the fixed per-sensor
/// schema. A field that fails to parse becomes `None`; the reading is
/// still emitted. Unknown sensors yield `None` overall.
fn decode_sensor_fields(sensor: &str, fields: &[&str]) -> Option<Measurements> {
    let field = |i: usize| -> Option<f64> { fields.get(i).and_then(|s| s.parse().ok()) };

    let mut measurements = Measurements::new();
    match sensor {
        "internal_bme" | "external_bme" => {
            measurements.insert("temp".into(), field(0));
            measurements.insert("humidity".into(), field(1));
            measurements.insert("pressure".into(), field(2));
        }
        "imu" => {
            measurements.insert("roll".into(), field(0));
            measurements.insert("pitch".into(), field(1));
            measurements.insert("yaw".into(), field(2));
            measurements.insert("temp".into(), field(3));
        }
        "load_current" => {
            // Reported in deciamps.
            measurements.insert("current".into(), field(0).map(|deciamps| deciamps / 10.0));
        }
        "panel_power" => {
            measurements.insert("voltage".into(), field(0));
            measurements.insert("current".into(), field(1));
        }
        _ => return None,
    }
    Some(measurements)
}
