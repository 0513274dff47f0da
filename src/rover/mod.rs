//! The rover-side bridge process.
//!
//! Four independently-retrying tasks: the broker session (this module),
//! the serial bridge to the microcontroller, the GPS reader and the
//! heartbeat timer. Each owns its own reconnect loop; none blocks the
//! others.

pub mod camera;
pub mod gps;
pub mod serial_bridge;
pub mod stats;

use crate::config::{RoverConfig, RECONNECT_DELAY_SECS};
use crate::protocol::{self, LogLevel, Message};
use camera::CameraController;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serial_bridge::SerialBridge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// System timestamp in nanoseconds, the unit used on the wire.
pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Handle the device tasks use to push messages toward the base station.
/// Messages queued while the broker session is down are discarded on the
/// next connect attempt.
#[derive(Clone)]
pub struct Upstream {
    tx: mpsc::UnboundedSender<Message>,
}

impl Upstream {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Upstream { tx }, rx)
    }

    pub fn send(&self, msg: Message) {
        // The session owns the receiver for the life of the process.
        let _ = self.tx.send(msg);
    }

    /// Logs locally and mirrors the line to the base station.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Critical => tracing::error!(critical = true, "{message}"),
        }
        self.send(Message::Log { message, level });
    }
}

/// Reconnecting broker-client loop: authenticate, then relay between the
/// upstream channel and the socket until the link drops.
pub struct RoverSession {
    config: RoverConfig,
    bridge: Arc<SerialBridge>,
    camera: CameraController,
    upstream: Upstream,
    outbound: mpsc::UnboundedReceiver<Message>,
}

impl RoverSession {
    pub fn new(
        config: RoverConfig,
        bridge: Arc<SerialBridge>,
        camera: CameraController,
        upstream: Upstream,
        outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        RoverSession {
            config,
            bridge,
            camera,
            upstream,
            outbound,
        }
    }

    pub async fn run(mut self) {
        loop {
            // Telemetry that piled up while disconnected is stale; drop it.
            while self.outbound.try_recv().is_ok() {}

            let ws = match connect_async(self.config.station_url.as_str()).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    tracing::error!(error = %e, url = %self.config.station_url, "Unable to reach base station");
                    tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                    continue;
                }
            };
            let (mut sink, mut stream) = ws.split();

            if !self.handshake(&mut sink, &mut stream).await {
                tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                continue;
            }
            tracing::info!("Connected to base station");

            loop {
                tokio::select! {
                    out = self.outbound.recv() => match out {
                        Some(msg) => match protocol::encode(&msg) {
                            Ok(frame) => {
                                if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, tag = msg.tag(), "Failed to encode upstream message");
                            }
                        },
                        // All upstream senders dropped: the process is going down.
                        None => return,
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match protocol::decode(text.as_str()) {
                                Ok(msg) => self.handle_message(msg).await,
                                Err(e) => {
                                    tracing::error!(error = %e, "Received invalid message from base station");
                                    self.upstream.send(Message::log(
                                        "Received invalid message",
                                        LogLevel::Error,
                                    ));
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                }
            }

            tracing::warn!(
                "Disconnected from base station, reconnecting in {RECONNECT_DELAY_SECS} seconds"
            );
            // A command with no operator watching it must not keep running.
            self.bridge.cancel_active().await;
            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    }

    /// Sends `auth` and waits for exactly one `auth_response`.
    async fn handshake<Si, St>(&self, sink: &mut Si, stream: &mut St) -> bool
    where
        Si: Sink<WsMessage> + Unpin,
        St: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let auth = Message::Auth {
            token: self.config.token.clone(),
        };
        let frame = match protocol::encode(&auth) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode auth message");
                return false;
            }
        };
        if sink.send(WsMessage::Text(frame.into())).await.is_err() {
            return false;
        }

        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => match protocol::decode(text.as_str()) {
                Ok(Message::AuthResponse { success: true, user }) => {
                    tracing::info!(?user, "Authenticated to base station");
                    true
                }
                Ok(Message::AuthResponse { success: false, .. }) => {
                    tracing::error!("Base station rejected authentication");
                    false
                }
                _ => {
                    tracing::error!("Received invalid auth response");
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Protocol,
                            reason: "invalid auth response".into(),
                        })))
                        .await;
                    false
                }
            },
            _ => false,
        }
    }

    async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Command { id, command } => self.bridge.submit(id, command).await,
            Message::EStop => self.bridge.e_stop().await,
            Message::PointCamera {
                yaw,
                pitch,
                relative,
            } => self.bridge.point_camera(yaw, pitch, relative).await,
            Message::ArduinoDebug { message } => self.bridge.write_raw(&message).await,
            Message::Option { get, set } => {
                let values = self.camera.apply(&get, &set, &self.upstream).await;
                self.upstream.send(Message::OptionResponse { values });
            }
            Message::Log { message, level } => {
                // Operator-facing broadcast mirrored into the local log.
                tracing::info!(level = level.as_str(), "Base station: {message}");
            }
            other => {
                self.upstream.send(Message::log(
                    format!("Received unexpected {} message", other.tag()),
                    LogLevel::Warning,
                ));
            }
        }
    }
}
