//! Realtime key-value relay used as the message transport between clients.
//!
//! The relay is an external service (a realtime database). The client only
//! needs keyed reads and writes, an existence check for user records, and a
//! change feed on a single key. [`memory::InMemoryRelay`] implements the
//! contract in-process for tests and the demo binary.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

pub use memory::InMemoryRelay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("write to {path} rejected: {reason}")]
    WriteRejected { path: String, reason: String },
    #[error("relay connection closed")]
    Closed,
}

/// Change feed for one relay key.
///
/// The receiver starts out holding the key's current value, so the first
/// observation is the initial value, as with realtime database listeners.
pub type RelayWatch = watch::Receiver<Option<String>>;

#[async_trait]
pub trait Relay: Send + Sync {
    /// Whether a user record was created at `path`.
    async fn exists(&self, path: &str) -> Result<bool, RelayError>;

    async fn read(&self, path: &str) -> Result<Option<String>, RelayError>;

    /// Overwrite the value at `path`. `None` deletes it. Returns once the
    /// relay acknowledged the write.
    async fn write(&self, path: &str, value: Option<String>) -> Result<(), RelayError>;

    async fn watch(&self, path: &str) -> Result<RelayWatch, RelayError>;

    /// Drop this client's connection to the relay.
    async fn go_offline(&self) -> Result<(), RelayError>;
}
