//! Connected-client bookkeeping for the base station.
//!
//! Each accepted connection gets a [`Client`] entry owning the outbound
//! message channel; a per-connection writer task drains that channel into
//! the socket. Broadcast snapshots the senders under the registry lock and
//! fans out afterwards, so a concurrent disconnect cannot corrupt an
//! in-flight broadcast.

use crate::protocol::{Message, Role};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One authenticated connection.
#[derive(Debug)]
pub struct Client {
    pub id: Uuid,
    pub role: Role,
    pub user: Option<String>,
    pub addr: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl Client {
    /// Creates the client and the receiving end of its outbound channel.
    pub fn new(
        role: Role,
        user: Option<String>,
        addr: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Client {
                id: Uuid::new_v4(),
                role,
                user,
                addr: addr.into(),
                tx,
            },
            rx,
        )
    }

    /// Queues a message for this client. Returns false if the writer task
    /// is gone, which is treated the same as a send failure mid-broadcast.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Short human-readable identity for log lines.
    pub fn describe(&self) -> String {
        match &self.user {
            Some(user) => format!("{} {} ({})", self.role, user, self.addr),
            None => format!("{} {}", self.role, self.addr),
        }
    }

    fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.tx.clone()
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<Uuid, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: Client) {
        self.clients.insert(client.id, client);
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.clients.values().filter(|c| c.role == role).count()
    }

    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &Client> {
        self.clients.values().filter(move |c| c.role == role)
    }

    pub fn all(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Snapshot of the outbound senders for one role, taken under the
    /// registry lock so the subsequent fan-out needs no lock at all.
    pub fn senders_for(&self, role: Role) -> Vec<(Uuid, mpsc::UnboundedSender<Message>)> {
        self.by_role(role).map(|c| (c.id, c.sender())).collect()
    }
}

/// Fans a message out to a snapshot of senders. One recipient's failure
/// never blocks or fails the others; failures are logged and dropped.
pub fn fan_out(targets: &[(Uuid, mpsc::UnboundedSender<Message>)], msg: &Message) {
    for (id, tx) in targets {
        if tx.send(msg.clone()).is_err() {
            tracing::debug!(client = %id, tag = msg.tag(), "Dropped broadcast to closing client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogLevel;

    #[test]
    fn roles_are_tracked_separately() {
        let mut registry = ClientRegistry::new();
        let (driver, _rx1) = Client::new(Role::Driver, Some("alice".into()), "10.0.0.1");
        let (rover, _rx2) = Client::new(Role::Rover, Some("sandshark".into()), "10.0.0.2");
        let driver_id = driver.id;
        registry.insert(driver);
        registry.insert(rover);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.count_role(Role::Driver), 1);
        assert_eq!(registry.count_role(Role::Rover), 1);
        assert!(registry.contains(driver_id));

        registry.remove(driver_id);
        assert_eq!(registry.count_role(Role::Driver), 0);
        assert_eq!(registry.count_role(Role::Rover), 1);
    }

    #[tokio::test]
    async fn fan_out_survives_a_dead_recipient() {
        let mut registry = ClientRegistry::new();
        let (alive, mut alive_rx) = Client::new(Role::Driver, None, "10.0.0.1");
        let (dead, dead_rx) = Client::new(Role::Driver, None, "10.0.0.2");
        registry.insert(alive);
        registry.insert(dead);
        drop(dead_rx);

        let targets = registry.senders_for(Role::Driver);
        fan_out(&targets, &Message::log("hello", LogLevel::Info));

        assert_eq!(
            alive_rx.recv().await,
            Some(Message::log("hello", LogLevel::Info))
        );
    }
}
