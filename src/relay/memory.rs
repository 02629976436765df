use super::{Relay, RelayError, RelayWatch};
use async_trait::async_trait;
use carelink_core::{PresenceStatus, RelayPaths, UserId};
use dashmap::{DashMap, DashSet};
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};

/// In-process relay with last-write-wins keys and watch-based change feeds.
///
/// Clones share the same store, so one instance can back several clients.
/// Every write is also appended to a history log that tests inspect.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    entries: Arc<DashMap<String, watch::Sender<Option<String>>>>,
    records: Arc<DashSet<String>>,
    history: Arc<Mutex<Vec<(String, Option<String>)>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for `user` the way the profile layer would during
    /// sign-up, so that the user is allowed to attach.
    pub fn register_user(&self, paths: &RelayPaths, user: &UserId) {
        self.records.insert(paths.user(user));
        self.sender(&paths.status(user))
            .send_replace(Some(PresenceStatus::Offline.as_str().to_string()));
    }

    /// When set, every write fails with [`RelayError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// All writes in the order they were acknowledged.
    pub async fn history(&self) -> Vec<(String, Option<String>)> {
        self.history.lock().await.clone()
    }

    /// Values written to one key, in order.
    pub async fn writes_to(&self, path: &str) -> Vec<Option<String>> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn peek(&self, path: &str) -> Option<String> {
        self.entries
            .get(path)
            .and_then(|sender| sender.borrow().clone())
    }

    fn sender(&self, path: &str) -> watch::Sender<Option<String>> {
        self.entries
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    async fn exists(&self, path: &str) -> Result<bool, RelayError> {
        // Mailbox writes create keys under any user path; only sign-up
        // creates the record itself.
        Ok(self.records.contains(path))
    }

    async fn read(&self, path: &str) -> Result<Option<String>, RelayError> {
        Ok(self.peek(path))
    }

    async fn write(&self, path: &str, value: Option<String>) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable(format!("write to {path} dropped")));
        }
        debug!(target: "Relay/Memory", "{path} <- {value:?}");
        // Hold the history lock across the store so the log order matches
        // the order watchers observe.
        let mut history = self.history.lock().await;
        self.sender(path).send_replace(value.clone());
        history.push((path.to_string(), value));
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<RelayWatch, RelayError> {
        Ok(self.sender(path).subscribe())
    }

    async fn go_offline(&self) -> Result<(), RelayError> {
        debug!(target: "Relay/Memory", "client went offline");
        Ok(())
    }
}
