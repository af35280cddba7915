//! External collaborators of the protocol core.
//!
//! The coordinator and agent only talk to git, the init system, and the
//! config store through these traits; `git`, `upstart`, and `store` hold
//! the production implementations.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncRead;

use crate::types::VersionPair;

pub mod git;
pub mod store;
pub mod upstart;

pub use git::{ChildOutput, GitBundleInstaller, GitCodebase, GitRepository};
pub use store::FileConfigStore;
pub use upstart::UpstartSupervisor;

/// Byte stream of one git bundle.
pub type BundleStream = Box<dyn AsyncRead + Unpin + Send>;

/// Source of the coordinator's desired app versions and their bundles.
#[async_trait]
pub trait CodebaseProvider: Send + Sync {
    async fn get_current_version(&self, app: &str) -> Result<Option<String>>;

    /// Bundle carrying `bundle.target()` as its `HEAD`, without the history
    /// already reachable from `bundle.base()`.
    ///
    /// A source that fails mid-stream must fail the read, not end it.
    async fn create_bundle_stream(&self, app: &str, bundle: &VersionPair) -> Result<BundleStream>;
}

/// Receives the raw bytes of one bundle.
#[async_trait]
pub trait BundleSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Called once after the last chunk; applies the bundle.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Agent-side application supervision.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, app: &str, branch: &str) -> Result<()>;

    async fn stop(&self, app: &str, branch: &str) -> Result<()>;

    /// Stop every instance of `app` and drop its working copy.
    async fn remove(&self, app: &str) -> Result<()>;

    async fn get_current_version(&self, app: &str) -> Result<Option<String>>;

    /// Apps with a working copy on this machine.
    async fn installed_apps(&self) -> Result<Vec<String>>;

    async fn create_bundle_installer(&self, app: &str) -> Result<Box<dyn BundleSink>>;
}

/// Read-only view of the config collections.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;
}
