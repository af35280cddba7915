//! Wire messages exchanged between coordinator and agents.
//!
//! Control messages travel as JSON objects tagged by a `type` field, one
//! object per line.  The discovery datagram uses the same tagging, while
//! the challenge header written on a fresh transfer socket carries no
//! `type` at all: the socket's purpose is implied by being new.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reported or desired version of every app a message talks about.
pub type VersionMap = BTreeMap<String, Option<String>>;

/// `[from-or-null, to]` revision pair identifying one bundle.
///
/// A bundle with no `from` carries the full history up to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionPair(pub Option<String>, pub String);

impl VersionPair {
    pub fn full(to: impl Into<String>) -> Self {
        Self(None, to.into())
    }

    pub fn delta(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self(Some(from.into()), to.into())
    }

    pub fn base(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn target(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base().unwrap_or("null"))?;
        write!(f, " -> {}", self.1)
    }
}

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Agent → coordinator, sent once right after the control channel opens.
    Role {
        environment: String,
        roles: Vec<String>,
    },
    /// Coordinator → agent, apps resolved from the reported roles.
    Apps { apps: Vec<String> },
    /// Agent → coordinator, snapshot of installed versions.
    Versions { apps: VersionMap },
    Install { apps: BTreeMap<String, String> },
    Upgrade { apps: BTreeMap<String, String> },
    Remove { apps: Vec<String> },
    /// Coordinator → agent, asks the agent to open a transfer socket.
    ConnectionChallenge {
        id: String,
        app: String,
        bundle: VersionPair,
    },
    Start { app: String, branch: String },
    Stop { app: String, branch: String },
}

impl Message {
    /// Serialise as one newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Role { .. } => "role",
            Message::Apps { .. } => "apps",
            Message::Versions { .. } => "versions",
            Message::Install { .. } => "install",
            Message::Upgrade { .. } => "upgrade",
            Message::Remove { .. } => "remove",
            Message::ConnectionChallenge { .. } => "connection-challenge",
            Message::Start { .. } => "start",
            Message::Stop { .. } => "stop",
        }
    }
}

/// Multicast datagram an agent broadcasts while it has no coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DiscoveryDatagram {
    NewMachine { tcp: u16 },
}

impl DiscoveryDatagram {
    pub fn tcp_port(&self) -> u16 {
        match self {
            DiscoveryDatagram::NewMachine { tcp } => *tcp,
        }
    }
}

/// First line written by the agent on a bundle-transfer socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeHeader {
    pub challenge: String,
    pub app: String,
    pub bundle: VersionPair,
}

impl ChallengeHeader {
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// `null` and `""` both mean the app is absent.
pub fn present(version: &Option<String>) -> Option<&str> {
    version.as_deref().filter(|v| !v.is_empty())
}
