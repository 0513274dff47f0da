//! The base station: registers connections by role, authenticates them,
//! and routes typed messages between drivers and rovers.

pub mod auth;
pub mod correlation;
pub mod persist;
pub mod registry;
pub mod router;

use crate::config::StationConfig;
use crate::protocol::{self, DecodeError, LogLevel, Message, ProtocolErrorKind, Role};
use auth::TokenResolver;
use correlation::{CommandQueue, CorrelationError, Dispatch};
use persist::TelemetryStore;
use registry::{fan_out, Client, ClientRegistry};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Protocol error: e.g. a non-auth first message.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Policy violation: e.g. failed auth or a duplicate auth.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Internal error: e.g. a message from an unregistered sender.
pub const CLOSE_INTERNAL: u16 = 1011;

/// Result of the first-message auth handshake.
pub enum AuthOutcome {
    /// Client is registered; `outbox` feeds the connection's writer and
    /// already holds the successful `auth_response`.
    Accepted {
        id: Uuid,
        outbox: mpsc::UnboundedReceiver<Message>,
    },
    /// Send `response` (if any), then close with `close_code`.
    Rejected {
        response: Option<Message>,
        close_code: u16,
    },
}

/// The message router. Owns the registry and the correlation queue;
/// constructed once per process and shared into every connection task.
pub struct Station {
    config: StationConfig,
    registry: Mutex<ClientRegistry>,
    queue: Mutex<CommandQueue>,
    resolver: Arc<dyn TokenResolver>,
    store: Arc<dyn TelemetryStore>,
}

impl Station {
    pub fn new(
        config: StationConfig,
        resolver: Arc<dyn TokenResolver>,
        store: Arc<dyn TelemetryStore>,
    ) -> Arc<Self> {
        Arc::new(Station {
            config,
            registry: Mutex::new(ClientRegistry::new()),
            queue: Mutex::new(CommandQueue::new()),
            resolver,
            store,
        })
    }

    /// Runs the first-message handshake for a new connection. The first
    /// frame must decode to `auth{token}`; anything else is rejected and
    /// the connection must reconnect to retry.
    pub async fn authenticate(
        &self,
        role: Role,
        addr: &str,
        first: Result<Message, DecodeError>,
    ) -> AuthOutcome {
        let token = match first {
            Ok(Message::Auth { token }) => token,
            Ok(other) => {
                tracing::warn!(
                    addr,
                    tag = other.tag(),
                    "Client sent a non-auth message before authenticating"
                );
                return AuthOutcome::Rejected {
                    response: Some(Message::AuthResponse {
                        success: false,
                        user: None,
                    }),
                    close_code: CLOSE_POLICY_VIOLATION,
                };
            }
            Err(e) => {
                tracing::warn!(addr, error = %e, "Unparseable first message");
                return AuthOutcome::Rejected {
                    response: None,
                    close_code: CLOSE_PROTOCOL_ERROR,
                };
            }
        };

        match self.resolver.resolve_token(&token).await {
            Some(user) => {
                let (client, outbox) = Client::new(role, Some(user.clone()), addr);
                let id = client.id;
                client.send(Message::AuthResponse {
                    success: true,
                    user: Some(user),
                });
                self.register(client).await;
                AuthOutcome::Accepted { id, outbox }
            }
            None => {
                tracing::warn!(addr, role = %role, "Rejected authentication attempt");
                AuthOutcome::Rejected {
                    response: Some(Message::AuthResponse {
                        success: false,
                        user: None,
                    }),
                    close_code: CLOSE_POLICY_VIOLATION,
                }
            }
        }
    }

    async fn register(&self, client: Client) {
        let line = {
            let mut registry = self.registry.lock().await;
            let line = match client.role {
                Role::Driver => (
                    LogLevel::Info,
                    format!("New driver connected: {}", client.describe()),
                ),
                // More than one rover is tolerated but unintended.
                Role::Rover if registry.count_role(Role::Rover) >= 1 => (
                    LogLevel::Warning,
                    format!(
                        "Rover connected while one was already connected: {}",
                        client.describe()
                    ),
                ),
                Role::Rover => (
                    LogLevel::Info,
                    format!("Rover connected: {}", client.describe()),
                ),
            };
            registry.insert(client);
            line
        };
        self.log_broadcast(line.0, line.1).await;
    }

    /// Removes a closed connection and applies the fail-safe: if the last
    /// driver just vanished, the rover loses its operator and gets an
    /// emergency stop.
    pub async fn handle_disconnect(&self, id: Uuid) {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.remove(id)
        };
        let client = match removed {
            Some(client) => client,
            None => {
                tracing::warn!(client = %id, "Disconnect for a client that was never registered");
                return;
            }
        };
        self.log_broadcast(
            LogLevel::Info,
            format!("Client disconnected: {}", client.describe()),
        )
        .await;

        match client.role {
            Role::Rover => {
                let rovers_left = self.registry.lock().await.count_role(Role::Rover);
                if rovers_left == 0 {
                    let (orphaned, status) = {
                        let mut queue = self.queue.lock().await;
                        let orphaned = queue.orphan_all();
                        (orphaned, self.queue_status_msg(&queue))
                    };
                    if orphaned > 0 {
                        self.log_broadcast(
                            LogLevel::Warning,
                            format!(
                                "Rover disconnected with {orphaned} pending command(s); their ids will never complete and have been dropped"
                            ),
                        )
                        .await;
                        self.broadcast_role(Role::Driver, status).await;
                    }
                }
            }
            Role::Driver => {
                let drivers_left = self.registry.lock().await.count_role(Role::Driver);
                if drivers_left == 0 && self.config.estop_on_driver_loss {
                    self.broadcast_role(Role::Rover, Message::EStop).await;
                    self.log_broadcast(
                        LogLevel::Warning,
                        "Last driver disconnected, broadcasting emergency stop".to_string(),
                    )
                    .await;
                }
            }
        }
    }

    /// Dispatches one decoded inbound message. Called strictly in arrival
    /// order by the per-connection loop. Returns false when the sender is
    /// no longer registered; the connection should close with 1011.
    pub async fn handle_message(&self, id: Uuid, msg: Message) -> bool {
        let (role, sender) = {
            let registry = self.registry.lock().await;
            match registry.get(id) {
                Some(client) => (client.role, client.describe()),
                None => {
                    tracing::warn!(client = %id, "Message from an unregistered sender");
                    return false;
                }
            }
        };

        match msg {
            Message::Auth { .. } => {
                // The connection loop closes on duplicate auth; nothing to do.
                tracing::warn!(%sender, "Duplicate auth message");
            }

            Message::Log { message, level } => {
                self.log_broadcast(level, format!("{sender} logged: {message}"))
                    .await;
            }

            Message::Command { id: cmd_id, command } => {
                if !self.require_role(role, Role::Driver, &sender, "command") {
                    return true;
                }
                match command {
                    None => {
                        // Cancels the rover's active command; the rover
                        // answers with command_ended which frees the id.
                        self.broadcast_role(
                            Role::Rover,
                            Message::Command {
                                id: cmd_id,
                                command: None,
                            },
                        )
                        .await;
                        self.log_broadcast(
                            LogLevel::Info,
                            format!("{sender} cancelled the current command"),
                        )
                        .await;
                    }
                    Some(command) => {
                        let outcome = {
                            let mut queue = self.queue.lock().await;
                            let outcome = queue.submit(cmd_id, id, command.clone());
                            (outcome, queue.pending_len())
                        };
                        match outcome {
                            (Err(CorrelationError::IdInUse(_)), _) => {
                                self.send_to(
                                    id,
                                    Message::error(
                                        ProtocolErrorKind::IdInUse,
                                        "The given command ID is already in use",
                                    ),
                                )
                                .await;
                                tracing::error!(%sender, id = cmd_id, "Command id already in use");
                            }
                            (Err(e), _) => {
                                tracing::error!(%sender, error = %e, "Command rejected");
                            }
                            (Ok(Dispatch::Now), depth) => {
                                self.broadcast_role(
                                    Role::Rover,
                                    Message::Command {
                                        id: cmd_id,
                                        command: Some(command.clone()),
                                    },
                                )
                                .await;
                                self.log_broadcast(
                                    LogLevel::Info,
                                    format!(
                                        "{sender} sent command {} (#{cmd_id}), dispatched (#{depth} pending)",
                                        command.name()
                                    ),
                                )
                                .await;
                            }
                            (Ok(Dispatch::Queued(position)), depth) => {
                                self.log_broadcast(
                                    LogLevel::Info,
                                    format!(
                                        "{sender} sent command {} (#{cmd_id}), queued at position {position} (#{depth} pending)",
                                        command.name()
                                    ),
                                )
                                .await;
                            }
                        }
                    }
                }
            }

            Message::ClearQueue => {
                if !self.require_role(role, Role::Driver, &sender, "clear_queue") {
                    return true;
                }
                let (dropped, status) = {
                    let mut queue = self.queue.lock().await;
                    let dropped = queue.clear();
                    (dropped, self.queue_status_msg(&queue))
                };
                self.log_broadcast(
                    LogLevel::Info,
                    format!("Queue cleared by {sender} ({dropped} command(s) dropped)"),
                )
                .await;
                self.broadcast_role(Role::Driver, status).await;
            }

            Message::CommandEnded {
                id: cmd_id,
                command,
                completed,
            } => {
                if !self.require_role(role, Role::Rover, &sender, "command_ended") {
                    return true;
                }
                let outcome = self.queue.lock().await.ended(cmd_id);
                match outcome {
                    Err(CorrelationError::UnknownId(_)) => {
                        self.send_to(
                            id,
                            Message::error(
                                ProtocolErrorKind::UnknownId,
                                "The given command ID is not valid",
                            ),
                        )
                        .await;
                        self.log_broadcast(
                            LogLevel::Error,
                            format!("{sender} ended command #{cmd_id} which is not pending"),
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::error!(%sender, error = %e, "command_ended rejected");
                    }
                    Ok(ended) => {
                        if ended.mismatch {
                            self.log_broadcast(
                                LogLevel::Warning,
                                format!(
                                    "{sender} ended command #{cmd_id} which is not the running command"
                                ),
                            )
                            .await;
                        }
                        self.broadcast_role(
                            Role::Driver,
                            Message::CommandEnded {
                                id: cmd_id,
                                command,
                                completed,
                            },
                        )
                        .await;
                        tracing::info!(
                            %sender,
                            id = cmd_id,
                            completed,
                            owner = %ended.owner,
                            "Routed command_ended"
                        );
                        if let Some(next) = ended.next {
                            self.broadcast_role(
                                Role::Rover,
                                Message::Command {
                                    id: next.id,
                                    command: Some(next.command.clone()),
                                },
                            )
                            .await;
                            self.log_broadcast(
                                LogLevel::Info,
                                format!(
                                    "Dispatched queued command {} (#{})",
                                    next.command.name(),
                                    next.id
                                ),
                            )
                            .await;
                        }
                    }
                }
            }

            Message::CommandStatus { command } => {
                if !self.require_role(role, Role::Rover, &sender, "command_status") {
                    return true;
                }
                self.broadcast_role(Role::Driver, Message::CommandStatus { command })
                    .await;
            }

            Message::Error { error, message } => {
                self.log_broadcast(
                    LogLevel::Error,
                    format!("{sender} reported error {error:?}: {message}"),
                )
                .await;
            }

            Message::Option { get, set } => {
                if !self.require_role(role, Role::Driver, &sender, "option") {
                    return true;
                }
                tracing::info!(%sender, ?get, set = %serde_json::Value::Object(set.clone()), "Option request");
                self.broadcast_role(Role::Rover, Message::Option { get, set })
                    .await;
            }

            Message::OptionResponse { values } => {
                if !self.require_role(role, Role::Rover, &sender, "option_response") {
                    return true;
                }
                tracing::info!(%sender, values = %serde_json::Value::Object(values.clone()), "Option response");
                self.broadcast_role(Role::Driver, Message::OptionResponse { values })
                    .await;
            }

            Message::SensorData {
                time,
                sensor,
                measurements,
            } => {
                if !self.require_role(role, Role::Rover, &sender, "sensor_data") {
                    return true;
                }
                self.broadcast_role(
                    Role::Driver,
                    Message::SensorData {
                        time,
                        sensor: sensor.clone(),
                        measurements: measurements.clone(),
                    },
                )
                .await;
                // Fire-and-forget: persistence never blocks forwarding.
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    if let Err(e) = store
                        .persist_sensor_reading(time, &sensor, &measurements)
                        .await
                    {
                        tracing::error!(error = %e, sensor, "Failed to persist sensor reading");
                    }
                });
            }

            Message::Nmea { time, sentence } => {
                if !self.require_role(role, Role::Rover, &sender, "nmea") {
                    return true;
                }
                // High volume, low operator value: persisted, not forwarded.
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    if let Err(e) = store.persist_nmea(time, &sentence).await {
                        tracing::error!(error = %e, "Failed to persist NMEA sentence");
                    }
                });
            }

            Message::EStop => {
                // Safety override: no role or queue checks. Queued commands
                // are dropped too, so nothing dispatches when the stopped
                // command is reported ended.
                self.broadcast_role(Role::Rover, Message::EStop).await;
                let (dropped, status) = {
                    let mut queue = self.queue.lock().await;
                    let dropped = queue.clear();
                    (dropped, self.queue_status_msg(&queue))
                };
                self.log_broadcast(LogLevel::Warning, format!("{sender} activated e-stop!"))
                    .await;
                if dropped > 0 {
                    self.broadcast_role(Role::Driver, status).await;
                }
            }

            Message::QueryBase { query } => {
                if !self.require_role(role, Role::Driver, &sender, "query_base") {
                    return true;
                }
                let value = self.answer_query(&query).await;
                self.send_to(id, Message::QueryBaseResponse { query, value })
                    .await;
            }

            Message::PointCamera {
                yaw,
                pitch,
                relative,
            } => {
                if !self.require_role(role, Role::Driver, &sender, "point_camera") {
                    return true;
                }
                self.broadcast_role(
                    Role::Rover,
                    Message::PointCamera {
                        yaw,
                        pitch,
                        relative,
                    },
                )
                .await;
            }

            Message::ArduinoDebug { message } => {
                if !self.require_role(role, Role::Driver, &sender, "arduino_debug") {
                    return true;
                }
                tracing::debug!(%sender, %message, "Forwarding raw debug line");
                self.broadcast_role(Role::Rover, Message::ArduinoDebug { message })
                    .await;
            }

            // Anything decodable but not meaningful from a client.
            other @ (Message::AuthResponse { .. }
            | Message::QueueStatus { .. }
            | Message::QueryBaseResponse { .. }) => {
                tracing::warn!(%sender, tag = other.tag(), "Unexpected message type");
            }
        }
        true
    }

    /// Answers a `query_base` locally, without leaving the broker.
    async fn answer_query(&self, query: &str) -> serde_json::Value {
        match query {
            "clients" => {
                let registry = self.registry.lock().await;
                let clients: Vec<serde_json::Value> = registry
                    .all()
                    .map(|c| {
                        serde_json::json!({
                            "role": c.role,
                            "user": c.user,
                            "addr": c.addr,
                        })
                    })
                    .collect();
                serde_json::Value::Array(clients)
            }
            "queue" => {
                let queue = self.queue.lock().await;
                let (current, queued) = queue.snapshot();
                serde_json::json!({
                    "current_command": current,
                    "queued_commands": queued,
                })
            }
            other => {
                tracing::warn!(query = other, "Unknown base query");
                serde_json::Value::Null
            }
        }
    }

    fn queue_status_msg(&self, queue: &CommandQueue) -> Message {
        let (current_command, queued_commands) = queue.snapshot();
        Message::QueueStatus {
            current_command,
            queued_commands,
        }
    }

    fn require_role(&self, actual: Role, required: Role, sender: &str, tag: &str) -> bool {
        if actual == required {
            true
        } else {
            tracing::warn!(sender, tag, required = %required, "Message rejected: wrong role");
            false
        }
    }

    /// Sends to one client by id. Returns false if it is gone.
    pub async fn send_to(&self, id: Uuid, msg: Message) -> bool {
        let registry = self.registry.lock().await;
        registry.get(id).map(|c| c.send(msg)).unwrap_or(false)
    }

    pub async fn broadcast_role(&self, role: Role, msg: Message) {
        let targets = self.registry.lock().await.senders_for(role);
        fan_out(&targets, &msg);
    }

    /// Writes to the local log and mirrors the line to all drivers.
    pub async fn log_broadcast(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Critical => tracing::error!(critical = true, "{message}"),
        }
        self.broadcast_role(Role::Driver, Message::Log { message, level })
            .await;
    }

    /// Decodes an inbound frame, reporting failures to the sender without
    /// dropping the connection.
    pub async fn decode_or_report(&self, id: Uuid, raw: &str) -> Option<Message> {
        match protocol::decode(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::error!(client = %id, error = %e, "Received invalid message");
                self.send_to(
                    id,
                    Message::error(ProtocolErrorKind::InvalidMessage, "The message sent is invalid"),
                )
                .await;
                None
            }
        }
    }
}
