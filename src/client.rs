use crate::calls::{CallError, CallHandle, CallOrchestrator};
use crate::channel::{ChannelError, MailboxSubscription, SignalChannel};
use crate::config::ClientConfig;
use crate::media::MediaTransport;
use crate::relay::Relay;
use carelink_core::{CoreEventBus, Envelope, EnvelopeError, EventHandler, RelayPaths, UserId};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("call error: {0}")]
    Call(#[from] CallError),
}

struct RunningSession {
    calls: CallHandle,
    /// Mailbox forwarder and orchestrator.
    tasks: JoinSet<()>,
}

/// One signed-in user: a signal channel, a media engine and, once connected,
/// an orchestrator actor.
pub struct Client {
    user_id: UserId,
    channel: Arc<SignalChannel>,
    media: Arc<dyn MediaTransport>,
    config: ClientConfig,
    event_bus: CoreEventBus,
    is_connecting: AtomicBool,
    session: Mutex<Option<RunningSession>>,
}

impl Client {
    pub fn new(
        user_id: UserId,
        relay: Arc<dyn Relay>,
        media: Arc<dyn MediaTransport>,
        config: ClientConfig,
    ) -> Self {
        let channel = Arc::new(SignalChannel::new(
            relay,
            RelayPaths::new(config.relay_root.as_str()),
        ));
        Self {
            user_id,
            channel,
            media,
            config,
            event_bus: CoreEventBus::new(),
            is_connecting: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The underlying channel, for presence lookups.
    pub fn channel(&self) -> &Arc<SignalChannel> {
        &self.channel
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_bus.add_handler(handler);
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Handle to the running orchestrator.
    pub async fn calls(&self) -> Result<CallHandle, ClientError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|running| running.calls.clone())
            .ok_or(ClientError::NotConnected)
    }

    /// Attach to the relay, subscribe to our mailbox and start the
    /// orchestrator.
    pub async fn connect(&self) -> Result<CallHandle, ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        self.channel.attach(&self.user_id).await?;
        let subscription = match self.channel.subscribe().await {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = self.channel.detach().await;
                return Err(e.into());
            }
        };

        let (inbox_tx, inbox) = mpsc::channel(self.config.command_buffer);
        let (orchestrator, calls) = CallOrchestrator::new(
            self.user_id.clone(),
            self.channel.clone(),
            self.media.clone(),
            self.event_bus.clone(),
            self.config.clone(),
            inbox,
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(forward_mailbox(subscription, inbox_tx));
        tasks.spawn(orchestrator.run());

        info!(target: "Client", "{} connected", self.user_id);
        *session = Some(RunningSession {
            calls: calls.clone(),
            tasks,
        });
        Ok(calls)
    }

    /// Ordered teardown: end or abort any call in progress and close media
    /// (inside the orchestrator), stop listening to the mailbox, then go
    /// OFFLINE.
    ///
    /// If going OFFLINE fails the error is returned and calling `logout`
    /// again retries just that step.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let running = self.session.lock().await.take();
        match running {
            Some(running) => Self::stop_session(running).await,
            None if self.channel.identity().is_some() => {
                info!(target: "Client", "Retrying detach for {}", self.user_id);
            }
            None => return Err(ClientError::NotConnected),
        }

        self.channel.detach().await?;
        info!(target: "Client", "{} logged out", self.user_id);
        Ok(())
    }

    async fn stop_session(mut running: RunningSession) {
        if let Err(e) = running.calls.shutdown().await {
            warn!(target: "Client", "Orchestrator was already gone: {e}");
        }
        running.tasks.abort_all();
        while let Some(joined) = running.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(target: "Client", "Background task panicked: {e}");
                }
            }
        }
    }
}

async fn forward_mailbox(
    subscription: MailboxSubscription,
    inbox: mpsc::Sender<Result<Envelope, EnvelopeError>>,
) {
    let mut envelopes = pin!(subscription.into_stream());
    while let Some(received) = envelopes.next().await {
        if inbox.send(received).await.is_err() {
            break;
        }
    }
    debug!(target: "Client", "Mailbox subscription ended");
}
