//! Pending bundle-transfer challenges.
//!
//! A challenge binds one future transfer socket to an exact app and
//! version pair.  It is consumed by the first header that names it,
//! whether that header matches or not, so a leaked id can never be
//! replayed and a mismatching header burns the challenge.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::time::Instant;

use crate::types::{ChallengeHeader, VersionPair};

/// Random bytes per challenge id.
const CHALLENGE_ID_BYTES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("Unknown challenge {0}")]
    UnknownChallenge(String),

    #[error("Challenge {id} was issued for {expected}, not {got}")]
    AppMismatch {
        id: String,
        expected: String,
        got: String,
    },

    #[error("Challenge {id} was issued for {expected}, not {got}")]
    VersionMismatch {
        id: String,
        expected: VersionPair,
        got: VersionPair,
    },

    #[error("Challenge {0} expired")]
    Expired(String),
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub machine: SocketAddr,
    pub app: String,
    pub bundle: VersionPair,
    issued_at: Instant,
}

pub fn generate_id() -> String {
    let mut bytes = [0u8; CHALLENGE_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug)]
pub struct ChallengeTable {
    pending: HashMap<String, Challenge>,
    ttl: Duration,
}

impl ChallengeTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    /// Record a new challenge for `app` on `machine`.
    ///
    /// Any pending challenge for the same machine and app is dropped, as are
    /// challenges older than the TTL.
    pub fn issue(&mut self, machine: SocketAddr, app: &str, bundle: VersionPair) -> Challenge {
        let now = Instant::now();
        let ttl = self.ttl;
        self.pending.retain(|_, c| {
            now.duration_since(c.issued_at) < ttl && !(c.machine == machine && c.app == app)
        });

        let challenge = Challenge {
            id: generate_id(),
            machine,
            app: app.to_string(),
            bundle,
            issued_at: now,
        };
        self.pending
            .insert(challenge.id.clone(), challenge.clone());
        challenge
    }

    /// Consume the challenge named by `header`.
    pub fn redeem(&mut self, header: &ChallengeHeader) -> Result<Challenge, ChallengeError> {
        let challenge = self
            .pending
            .remove(&header.challenge)
            .ok_or_else(|| ChallengeError::UnknownChallenge(header.challenge.clone()))?;

        if Instant::now().duration_since(challenge.issued_at) >= self.ttl {
            return Err(ChallengeError::Expired(challenge.id));
        }
        if challenge.app != header.app {
            return Err(ChallengeError::AppMismatch {
                id: challenge.id,
                expected: challenge.app,
                got: header.app.clone(),
            });
        }
        if challenge.bundle != header.bundle {
            return Err(ChallengeError::VersionMismatch {
                id: challenge.id,
                expected: challenge.bundle,
                got: header.bundle.clone(),
            });
        }
        Ok(challenge)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}
