//! Command correlation for the base station.
//!
//! Drivers assign an integer id to every command; the queue tracks which
//! driver owns which id so the rover's `command_ended` can be routed back.
//! Ids must be unique among pending commands. At most one command is
//! dispatched to the rover at a time; later commands wait in a FIFO queue
//! until the current one ends.
//!
//! No command deadline exists anywhere in this protocol: a command that
//! never ends and is never cancelled holds its id until the queue is
//! cleared or the rover disconnects. See DESIGN.md.

use crate::protocol::{Command, QueuedCommand};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("command id {0} is already in use")]
    IdInUse(i64),
    #[error("command id {0} is not pending")]
    UnknownId(i64),
}

/// A command the base station has accepted but not yet seen end.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub id: i64,
    /// The driver that owns the id and receives the routed response.
    pub driver: Uuid,
    pub command: Command,
    pub queued_at: DateTime<Utc>,
}

/// Whether a submitted command went straight to the rover or is waiting.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Dispatched immediately; nothing was in flight.
    Now,
    /// Queued behind the current command at this position (1-based).
    Queued(usize),
}

/// Outcome of a `command_ended` from the rover.
#[derive(Debug, PartialEq)]
pub struct Ended {
    /// The driver that submitted the ended command.
    pub owner: Uuid,
    /// The ended id did not match the current command. Tolerated (exactly
    /// one rover is intended) but worth a warning.
    pub mismatch: bool,
    /// The next queued command to dispatch, if any.
    pub next: Option<PendingCommand>,
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: HashMap<i64, PendingCommand>,
    queued: VecDeque<i64>,
    current: Option<i64>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver command. Returns whether it should be forwarded
    /// to the rover now or has been queued behind the current command.
    pub fn submit(
        &mut self,
        id: i64,
        driver: Uuid,
        command: Command,
    ) -> Result<Dispatch, CorrelationError> {
        if self.pending.contains_key(&id) {
            return Err(CorrelationError::IdInUse(id));
        }
        self.pending.insert(
            id,
            PendingCommand {
                id,
                driver,
                command,
                queued_at: Utc::now(),
            },
        );
        if self.current.is_none() {
            self.current = Some(id);
            Ok(Dispatch::Now)
        } else {
            self.queued.push_back(id);
            Ok(Dispatch::Queued(self.queued.len()))
        }
    }

    /// Frees an id on `command_ended` and pops the next queued command
    /// into the current slot.
    pub fn ended(&mut self, id: i64) -> Result<Ended, CorrelationError> {
        let pending = self
            .pending
            .remove(&id)
            .ok_or(CorrelationError::UnknownId(id))?;
        let mismatch = self.current != Some(id);
        if mismatch {
            // A stray response; leave the current slot alone.
            self.queued.retain(|&queued| queued != id);
        } else {
            self.current = self.queued.pop_front();
        }
        let next = self
            .current
            .filter(|_| !mismatch)
            .and_then(|next_id| self.pending.get(&next_id).cloned());
        Ok(Ended {
            owner: pending.driver,
            mismatch,
            next,
        })
    }

    /// Drains all queued-but-not-dispatched commands and frees their ids.
    /// The current command is untouched. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queued.len();
        for id in self.queued.drain(..) {
            self.pending.remove(&id);
        }
        dropped
    }

    /// Drops everything, current command included. Used when the rover
    /// disconnects and pending ids can never complete.
    pub fn orphan_all(&mut self) -> usize {
        let orphaned = self.pending.len();
        self.pending.clear();
        self.queued.clear();
        self.current = None;
        orphaned
    }

    pub fn current(&self) -> Option<&PendingCommand> {
        self.current.and_then(|id| self.pending.get(&id))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The `queue_status` view broadcast to drivers.
    pub fn snapshot(&self) -> (Option<QueuedCommand>, Vec<QueuedCommand>) {
        let to_info = |p: &PendingCommand| QueuedCommand {
            id: p.id,
            command: p.command.clone(),
        };
        let current = self.current().map(to_info);
        let queued = self
            .queued
            .iter()
            .filter_map(|id| self.pending.get(id))
            .map(to_info)
            .collect();
        (current, queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Command {
        Command::MoveContinuous {
            speed: 0.5,
            angle: 0.0,
        }
    }

    #[test]
    fn fresh_ids_never_collide_reused_ids_always_do() {
        let mut queue = CommandQueue::new();
        let driver = Uuid::new_v4();
        for id in 0..10 {
            assert!(queue.submit(id, driver, cmd()).is_ok());
        }
        for id in 0..10 {
            assert_eq!(
                queue.submit(id, driver, cmd()),
                Err(CorrelationError::IdInUse(id))
            );
        }
    }

    #[test]
    fn first_command_dispatches_later_ones_queue() {
        let mut queue = CommandQueue::new();
        let driver = Uuid::new_v4();
        assert_eq!(queue.submit(1, driver, cmd()), Ok(Dispatch::Now));
        assert_eq!(queue.submit(2, driver, cmd()), Ok(Dispatch::Queued(1)));
        assert_eq!(queue.submit(3, driver, cmd()), Ok(Dispatch::Queued(2)));
        assert_eq!(queue.current().map(|p| p.id), Some(1));
    }

    #[test]
    fn ended_routes_to_owner_and_advances_the_queue() {
        let mut queue = CommandQueue::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        queue.submit(1, alice, cmd()).unwrap();
        queue.submit(2, bob, cmd()).unwrap();

        let ended = queue.ended(1).unwrap();
        assert_eq!(ended.owner, alice);
        assert!(!ended.mismatch);
        assert_eq!(ended.next.as_ref().map(|p| p.id), Some(2));
        assert_eq!(queue.current().map(|p| p.id), Some(2));

        let ended = queue.ended(2).unwrap();
        assert_eq!(ended.owner, bob);
        assert!(ended.next.is_none());
        assert!(queue.current().is_none());
    }

    #[test]
    fn unknown_id_is_reported_not_fatal() {
        let mut queue = CommandQueue::new();
        assert_eq!(queue.ended(42), Err(CorrelationError::UnknownId(42)));
    }

    #[test]
    fn mismatched_end_is_accepted_but_flagged() {
        let mut queue = CommandQueue::new();
        let driver = Uuid::new_v4();
        queue.submit(1, driver, cmd()).unwrap();
        queue.submit(2, driver, cmd()).unwrap();

        // Id 2 ends while 1 is the current command.
        let ended = queue.ended(2).unwrap();
        assert!(ended.mismatch);
        assert!(ended.next.is_none());
        // The current command is still in flight.
        assert_eq!(queue.current().map(|p| p.id), Some(1));
        // Its id is freed.
        assert_eq!(queue.submit(2, driver, cmd()), Ok(Dispatch::Queued(1)));
    }

    #[test]
    fn clear_drops_queued_but_not_current_and_is_idempotent() {
        let mut queue = CommandQueue::new();
        let driver = Uuid::new_v4();
        queue.submit(1, driver, cmd()).unwrap();
        queue.submit(2, driver, cmd()).unwrap();
        queue.submit(3, driver, cmd()).unwrap();

        assert_eq!(queue.clear(), 2);
        let (current, queued) = queue.snapshot();
        assert_eq!(current.as_ref().map(|c| c.id), Some(1));
        assert!(queued.is_empty());

        // Cleared ids are free again.
        assert_eq!(queue.submit(2, driver, cmd()), Ok(Dispatch::Queued(1)));
        queue.ended(2).ok();

        assert_eq!(queue.clear(), 0);
        assert_eq!(queue.clear(), 0);
        let (current, queued) = queue.snapshot();
        assert_eq!(current.as_ref().map(|c| c.id), Some(1));
        assert!(queued.is_empty());
    }

    #[test]
    fn clear_on_empty_queue_snapshots_identically() {
        let mut queue = CommandQueue::new();
        queue.clear();
        let first = queue.snapshot();
        queue.clear();
        let second = queue.snapshot();
        assert_eq!(first, second);
        assert_eq!(first, (None, vec![]));
    }

    #[test]
    fn orphan_all_frees_everything() {
        let mut queue = CommandQueue::new();
        let driver = Uuid::new_v4();
        queue.submit(1, driver, cmd()).unwrap();
        queue.submit(2, driver, cmd()).unwrap();
        assert_eq!(queue.orphan_all(), 2);
        assert!(queue.current().is_none());
        assert_eq!(queue.submit(1, driver, cmd()), Ok(Dispatch::Now));
    }
}
