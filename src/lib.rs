//! Reparto: one coordinator keeps a fleet of agents running the app
//! versions it holds in git.

pub mod agent;
pub mod challenge;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod roles;
pub mod runtime;
pub mod timer;
pub mod transfer;
pub mod types;
