//! Relay key layout.
//!
//! ```text
//! {root}/{userId}/status       ONLINE | OFFLINE | IN_CALL
//! {root}/{userId}/latestEvent  JSON envelope | null
//! ```

use crate::types::user::UserId;

pub const DEFAULT_ROOT: &str = "users";
pub const STATUS_KEY: &str = "status";
pub const LATEST_EVENT_KEY: &str = "latestEvent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPaths {
    root: String,
}

impl RelayPaths {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// The record that must exist before a user may attach.
    pub fn user(&self, user: &UserId) -> String {
        format!("{}/{}", self.root, user)
    }

    pub fn status(&self, user: &UserId) -> String {
        format!("{}/{}/{}", self.root, user, STATUS_KEY)
    }

    /// The single-slot mailbox of `user`.
    pub fn latest_event(&self, user: &UserId) -> String {
        format!("{}/{}/{}", self.root, user, LATEST_EVENT_KEY)
    }
}

impl Default for RelayPaths {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}
