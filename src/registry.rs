//! Coordinator-side machine membership.
//!
//! Machines are keyed by `address:port`, where the port is the one the
//! agent announced in its discovery datagram.  Entries are never removed;
//! a dead machine stays in the table as `Down` until a reconnect brings it
//! back.  Status transitions belong to the connection tasks of the
//! coordinator, the registry only records them.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

use crate::channel::Outbox;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    New,
    Connecting,
    Up,
    Down,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineStatus::New => "new",
            MachineStatus::Connecting => "connecting",
            MachineStatus::Up => "up",
            MachineStatus::Down => "down",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct MachineEntry {
    pub key: SocketAddr,
    pub status: MachineStatus,
    /// Live control channel, present only while `Up`.
    pub outbox: Option<Outbox>,
    pub environment: Option<String>,
    pub roles: Vec<String>,
    pub reconnect: Timer,
}

impl MachineEntry {
    fn new(key: SocketAddr) -> Self {
        Self {
            key,
            status: MachineStatus::New,
            outbox: None,
            environment: None,
            roles: Vec::new(),
            reconnect: Timer::new(),
        }
    }
}

/// Point-in-time view of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineSnapshot {
    pub key: SocketAddr,
    pub status: MachineStatus,
    pub environment: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MachineRegistry {
    machines: HashMap<SocketAddr, MachineEntry>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key` as `New` unless already known.
    ///
    /// Returns `true` only for the call that created the entry; the caller
    /// must hold the registry lock across this check and the decision to
    /// connect.
    pub fn register(&mut self, key: SocketAddr) -> bool {
        if self.machines.contains_key(&key) {
            return false;
        }
        self.machines.insert(key, MachineEntry::new(key));
        true
    }

    pub fn get(&self, key: &SocketAddr) -> Option<&MachineEntry> {
        self.machines.get(key)
    }

    pub fn get_mut(&mut self, key: &SocketAddr) -> Option<&mut MachineEntry> {
        self.machines.get_mut(key)
    }

    pub fn status(&self, key: &SocketAddr) -> Option<MachineStatus> {
        self.machines.get(key).map(|m| m.status)
    }

    pub fn mark_connecting(&mut self, key: &SocketAddr) {
        if let Some(entry) = self.machines.get_mut(key) {
            entry.status = MachineStatus::Connecting;
        }
    }

    pub fn mark_up(&mut self, key: &SocketAddr, outbox: Outbox) {
        if let Some(entry) = self.machines.get_mut(key) {
            entry.status = MachineStatus::Up;
            entry.outbox = Some(outbox);
        }
    }

    pub fn mark_down(&mut self, key: &SocketAddr) {
        if let Some(entry) = self.machines.get_mut(key) {
            entry.status = MachineStatus::Down;
            entry.outbox = None;
        }
    }

    pub fn record_roles(&mut self, key: &SocketAddr, environment: &str, roles: &[String]) {
        if let Some(entry) = self.machines.get_mut(key) {
            entry.environment = Some(environment.to_string());
            entry.roles = roles.to_vec();
        }
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn snapshot(&self) -> Vec<MachineSnapshot> {
        let mut machines: Vec<_> = self
            .machines
            .values()
            .map(|m| MachineSnapshot {
                key: m.key,
                status: m.status,
                environment: m.environment.clone(),
                roles: m.roles.clone(),
            })
            .collect();
        machines.sort_by_key(|m| m.key);
        machines
    }
}

/// Delay before reconnecting to a machine whose channel just closed.
///
/// A clean close usually means the agent restarted, so retry at once; an
/// error waits `backoff` to avoid hot-looping on a broken network.
pub fn reconnect_delay(closed_with_error: bool, backoff: Duration) -> Duration {
    if closed_with_error {
        backoff
    } else {
        Duration::ZERO
    }
}
