//! Signal Channel: envelope delivery through per-user relay mailboxes.
//!
//! Each user owns one mailbox slot (`{root}/{userId}/latestEvent`). Sending
//! overwrites the target's slot, so the relay holds at most one pending
//! envelope per recipient. Two sends racing to the same target can lose the
//! first one; callers tolerate that through timeouts rather than queuing.

use crate::relay::{Relay, RelayError, RelayWatch};
use carelink_core::{Envelope, EnvelopeError, PresenceStatus, RelayPaths, Signal, UserId};
use futures_util::Stream;
use futures_util::stream;
use log::{debug, info};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no identity attached to the channel")]
    NotAttached,
    #[error("user {0} is not registered with the relay")]
    UnknownUser(UserId),
    #[error("envelope has no target")]
    MissingTarget,
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("relay holds an unreadable status {0:?}")]
    InvalidStatus(String),
}

pub struct SignalChannel {
    relay: Arc<dyn Relay>,
    paths: RelayPaths,
    identity: RwLock<Option<UserId>>,
}

impl SignalChannel {
    pub fn new(relay: Arc<dyn Relay>, paths: RelayPaths) -> Self {
        Self {
            relay,
            paths,
            identity: RwLock::new(None),
        }
    }

    pub fn paths(&self) -> &RelayPaths {
        &self.paths
    }

    /// The attached identity, if any.
    pub fn identity(&self) -> Option<UserId> {
        self.identity
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }

    fn require_identity(&self) -> Result<UserId, ChannelError> {
        self.identity().ok_or(ChannelError::NotAttached)
    }

    /// Mark `self_id` present in the relay.
    ///
    /// The user record must already exist. Any envelope left in the mailbox
    /// by a previous session is cleared so it is not replayed, then the
    /// status is set to ONLINE.
    pub async fn attach(&self, self_id: &UserId) -> Result<(), ChannelError> {
        if !self.relay.exists(&self.paths.user(self_id)).await? {
            return Err(ChannelError::UnknownUser(self_id.clone()));
        }
        *self.identity.write().expect("RwLock should not be poisoned") = Some(self_id.clone());

        self.clear_mailbox().await?;
        self.set_status(PresenceStatus::Online).await?;
        info!(target: "Channel", "Attached as {self_id}");
        Ok(())
    }

    /// Observe our own mailbox.
    pub async fn subscribe(&self) -> Result<MailboxSubscription, ChannelError> {
        let me = self.require_identity()?;
        let feed = self.relay.watch(&self.paths.latest_event(&me)).await?;
        debug!(target: "Channel", "Subscribed to mailbox of {me}");
        Ok(MailboxSubscription {
            feed,
            initial_pending: true,
        })
    }

    /// Stamp the sender, serialize and overwrite the target's mailbox.
    ///
    /// Success means the relay acknowledged the write; it says nothing about
    /// whether the target is online.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), ChannelError> {
        let me = self.require_identity()?;
        let target = match UserId::new(envelope.target.as_str()) {
            Ok(target) => target,
            Err(_) => return Err(ChannelError::MissingTarget),
        };
        envelope.sender = me.to_string();
        let json = envelope.to_json()?;
        self.relay
            .write(&self.paths.latest_event(&target), Some(json))
            .await?;
        debug!(target: "Channel", "{} -> {target}", envelope.kind);
        Ok(())
    }

    /// Convenience wrapper over [`send`](Self::send) for a typed signal.
    pub async fn send_signal(&self, target: &UserId, signal: &Signal) -> Result<(), ChannelError> {
        self.send(Envelope::new(target, signal)?).await
    }

    /// Empty our own mailbox slot.
    pub async fn clear_mailbox(&self) -> Result<(), ChannelError> {
        let me = self.require_identity()?;
        self.relay.write(&self.paths.latest_event(&me), None).await?;
        Ok(())
    }

    pub async fn set_status(&self, status: PresenceStatus) -> Result<(), ChannelError> {
        let me = self.require_identity()?;
        self.relay
            .write(&self.paths.status(&me), Some(status.as_str().to_string()))
            .await?;
        debug!(target: "Channel", "Status of {me} is now {status}");
        Ok(())
    }

    /// Read another user's status. Missing or unset means OFFLINE.
    pub async fn status_of(&self, user: &UserId) -> Result<PresenceStatus, ChannelError> {
        match self.relay.read(&self.paths.status(user)).await? {
            None => Ok(PresenceStatus::Offline),
            Some(raw) => raw.parse().map_err(|_| ChannelError::InvalidStatus(raw)),
        }
    }

    /// Follow another user's status. Values that do not parse are skipped.
    pub async fn watch_status(
        &self,
        user: &UserId,
    ) -> Result<impl Stream<Item = PresenceStatus> + Send + 'static, ChannelError> {
        let feed = self.relay.watch(&self.paths.status(user)).await?;
        Ok(stream::unfold((feed, true), |(mut feed, mut first)| async move {
            loop {
                if !first {
                    feed.changed().await.ok()?;
                }
                first = false;
                let status = match feed.borrow_and_update().as_deref() {
                    None => Some(PresenceStatus::Offline),
                    Some(raw) => raw.parse().ok(),
                };
                if let Some(status) = status {
                    return Some((status, (feed, false)));
                }
            }
        }))
    }

    /// Go OFFLINE and drop the relay connection.
    pub async fn detach(&self) -> Result<(), ChannelError> {
        let me = self.require_identity()?;
        self.set_status(PresenceStatus::Offline).await?;
        self.relay.go_offline().await?;
        *self.identity.write().expect("RwLock should not be poisoned") = None;
        info!(target: "Channel", "Detached {me}");
        Ok(())
    }
}

/// Live view of our own mailbox.
///
/// Yields one item per change of the slot, starting with the value present
/// at subscription time. Empty slots are not events and are skipped.
/// Undecodable envelopes are yielded as errors so the consumer can log and
/// drop them without ending the subscription.
pub struct MailboxSubscription {
    feed: RelayWatch,
    initial_pending: bool,
}

impl MailboxSubscription {
    /// Wait for the next envelope. `None` once the relay side is gone.
    pub async fn next(&mut self) -> Option<Result<Envelope, EnvelopeError>> {
        loop {
            if self.initial_pending {
                self.initial_pending = false;
            } else if self.feed.changed().await.is_err() {
                return None;
            }
            let raw = self.feed.borrow_and_update().clone();
            match raw {
                None => continue,
                Some(raw) if raw.trim().is_empty() || raw == "null" => continue,
                Some(raw) => return Some(Envelope::from_json(&raw)),
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Envelope, EnvelopeError>> + Send {
        stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::InMemoryRelay;
    use carelink_core::{CallMedia, SignalType};
    use futures_util::StreamExt;
    use std::time::Duration;

    fn id(s: &str) -> UserId {
        s.parse().unwrap()
    }

    fn setup() -> (InMemoryRelay, SignalChannel) {
        let relay = InMemoryRelay::new();
        let paths = RelayPaths::default();
        relay.register_user(&paths, &id("caregiver_7"));
        relay.register_user(&paths, &id("viu_42"));
        let channel = SignalChannel::new(Arc::new(relay.clone()), paths);
        (relay, channel)
    }

    #[tokio::test]
    async fn attach_requires_a_registered_record() {
        let (_, channel) = setup();
        let err = channel.attach(&id("intruder")).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownUser(_)));
        assert!(channel.identity().is_none());
    }

    #[tokio::test]
    async fn sending_to_a_stranger_does_not_register_them() {
        let (relay, channel) = setup();
        channel.attach(&id("caregiver_7")).await.unwrap();
        channel
            .send_signal(&id("ghost"), &Signal::EndCall)
            .await
            .unwrap();

        let ghost = SignalChannel::new(Arc::new(relay), RelayPaths::default());
        let err = ghost.attach(&id("ghost")).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn attach_clears_stale_mailbox_and_goes_online() {
        let (relay, channel) = setup();
        relay
            .write("users/caregiver_7/latestEvent", Some("{\"stale\":true}".into()))
            .await
            .unwrap();

        channel.attach(&id("caregiver_7")).await.unwrap();

        assert!(relay.peek("users/caregiver_7/latestEvent").is_none());
        assert_eq!(
            relay.peek("users/caregiver_7/status").as_deref(),
            Some("ONLINE")
        );
    }

    #[tokio::test]
    async fn send_overwrites_spoofed_sender() {
        let (relay, channel) = setup();
        channel.attach(&id("caregiver_7")).await.unwrap();

        let mut envelope = Envelope::new(&id("viu_42"), &Signal::StartCall(CallMedia::Video)).unwrap();
        envelope.sender = "someone_else".into();
        channel.send(envelope).await.unwrap();

        let raw = relay.peek("users/viu_42/latestEvent").unwrap();
        let delivered = Envelope::from_json(&raw).unwrap();
        assert_eq!(delivered.sender, "caregiver_7");
        assert_eq!(delivered.target, "viu_42");
        assert_eq!(delivered.kind, SignalType::StartVideoCall);
    }

    #[tokio::test]
    async fn send_rejects_empty_target() {
        let (relay, channel) = setup();
        channel.attach(&id("caregiver_7")).await.unwrap();
        let writes_before = relay.history().await.len();

        for target in ["", "  "] {
            let envelope = Envelope {
                kind: SignalType::EndCall,
                sender: String::new(),
                target: target.into(),
                data: None,
            };
            assert!(matches!(
                channel.send(envelope).await,
                Err(ChannelError::MissingTarget)
            ));
        }
        assert_eq!(relay.history().await.len(), writes_before);
    }

    #[tokio::test]
    async fn sending_without_identity_is_a_hard_error() {
        let (_, channel) = setup();
        let result = channel.send_signal(&id("viu_42"), &Signal::EndCall).await;
        assert!(matches!(result, Err(ChannelError::NotAttached)));
    }

    #[tokio::test]
    async fn relay_failures_surface_to_the_caller() {
        let (relay, channel) = setup();
        channel.attach(&id("caregiver_7")).await.unwrap();
        relay.set_failing(true);
        let result = channel.send_signal(&id("viu_42"), &Signal::EndCall).await;
        assert!(matches!(result, Err(ChannelError::Relay(RelayError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn subscription_skips_empty_slots_and_reports_garbage() {
        let (relay, channel) = setup();
        channel.attach(&id("viu_42")).await.unwrap();
        let mut sub = channel.subscribe().await.unwrap();

        relay
            .write("users/viu_42/latestEvent", Some("garbage".into()))
            .await
            .unwrap();
        assert!(matches!(sub.next().await, Some(Err(EnvelopeError::Malformed(_)))));

        relay.write("users/viu_42/latestEvent", None).await.unwrap();
        let sender = SignalChannel::new(Arc::new(relay.clone()), RelayPaths::default());
        sender.attach(&id("caregiver_7")).await.unwrap();
        sender.send_signal(&id("viu_42"), &Signal::DenyCall).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(envelope.kind, SignalType::DenyCall);
        assert_eq!(envelope.sender, "caregiver_7");
    }

    #[tokio::test]
    async fn detach_sets_offline_and_forgets_identity() {
        let (relay, channel) = setup();
        channel.attach(&id("viu_42")).await.unwrap();
        channel.detach().await.unwrap();
        assert_eq!(relay.peek("users/viu_42/status").as_deref(), Some("OFFLINE"));
        assert!(matches!(
            channel.clear_mailbox().await,
            Err(ChannelError::NotAttached)
        ));
    }

    #[tokio::test]
    async fn peers_can_observe_but_not_write_each_others_status() {
        let (_, caregiver) = setup();
        caregiver.attach(&id("caregiver_7")).await.unwrap();
        assert_eq!(
            caregiver.status_of(&id("viu_42")).await.unwrap(),
            PresenceStatus::Offline
        );

        let viu = SignalChannel::new(caregiver.relay.clone(), RelayPaths::default());
        let mut statuses = Box::pin(caregiver.watch_status(&id("viu_42")).await.unwrap());
        assert_eq!(statuses.next().await, Some(PresenceStatus::Offline));

        viu.attach(&id("viu_42")).await.unwrap();
        viu.set_status(PresenceStatus::InCall).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(status)) =
            tokio::time::timeout(Duration::from_millis(200), statuses.next()).await
        {
            seen.push(status);
            if status == PresenceStatus::InCall {
                break;
            }
        }
        assert_eq!(seen.last(), Some(&PresenceStatus::InCall));
    }
}
