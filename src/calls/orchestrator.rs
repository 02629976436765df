//! The signaling orchestrator actor.
//!
//! One task owns the [`CallSession`] and serializes everything that can move
//! it: local commands from [`CallHandle`]s, envelopes from the mailbox
//! subscription, media engine callbacks and the phase timer. Each input's side
//! effects are issued before the next input is looked at.

use super::error::CallError;
use super::state::{CallAction, CallInput, CallSession, CallSnapshot, TimeoutKind};
use crate::channel::{ChannelError, SignalChannel};
use crate::config::ClientConfig;
use crate::media::{
    MediaError, MediaEvent, MediaTransport, PeerConnectionState, ScreenCaptureToken,
};
use carelink_core::types::events::{SignalSendFailed, StatusChanged};
use carelink_core::{
    CallId, CallMedia, CallPhase, CoreEventBus, Envelope, EnvelopeError, Event, SessionDescription,
    Signal, UserId,
};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

pub(crate) type EnvelopeInbox = mpsc::Receiver<Result<Envelope, EnvelopeError>>;

enum Command {
    Local {
        input: CallInput,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running orchestrator.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    async fn request(&self, input: CallInput) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Local { input, reply })
            .await
            .map_err(|_| CallError::Closed)?;
        response.await.map_err(|_| CallError::Closed)?
    }

    /// Ring `target`. Fails unless the session is idle.
    pub async fn call(&self, target: &UserId, media: CallMedia) -> Result<(), CallError> {
        self.request(CallInput::PlaceCall {
            peer: target.clone(),
            media,
        })
        .await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(CallInput::Accept).await
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(CallInput::Decline).await
    }

    /// Aborts an unanswered call, or ends one in progress.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(CallInput::HangUp).await
    }

    pub async fn set_audio_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(CallInput::SetAudioMuted(muted)).await
    }

    pub async fn set_video_off(&self, off: bool) -> Result<(), CallError> {
        self.request(CallInput::SetVideoOff(off)).await
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.request(CallInput::SwitchCamera).await
    }

    pub async fn start_screen_share(&self, token: ScreenCaptureToken) -> Result<(), CallError> {
        self.request(CallInput::StartScreenShare(token)).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(CallInput::StopScreenShare).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.snapshot.borrow().phase
    }

    /// Receiver that changes every time the session does.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Stop the orchestrator: tell the peer about any call in progress,
    /// close media, exit.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| CallError::Closed)?;
        done.await.map_err(|_| CallError::Closed)
    }
}

pub struct CallOrchestrator {
    me: UserId,
    session: CallSession,
    channel: Arc<SignalChannel>,
    media: Arc<dyn MediaTransport>,
    event_bus: CoreEventBus,
    config: ClientConfig,
    commands: mpsc::Receiver<Command>,
    envelopes: EnvelopeInbox,
    media_events: Option<mpsc::Receiver<MediaEvent>>,
    deadline: Option<(Instant, TimeoutKind)>,
    snapshot: watch::Sender<CallSnapshot>,
}

impl CallOrchestrator {
    pub(crate) fn new(
        me: UserId,
        channel: Arc<SignalChannel>,
        media: Arc<dyn MediaTransport>,
        event_bus: CoreEventBus,
        config: ClientConfig,
        envelopes: EnvelopeInbox,
    ) -> (Self, CallHandle) {
        let (command_tx, commands) = mpsc::channel(config.command_buffer);
        let session = CallSession::new();
        let (snapshot, snapshot_rx) = watch::channel(session.snapshot());
        let orchestrator = Self {
            me,
            session,
            channel,
            media,
            event_bus,
            config,
            commands,
            envelopes,
            media_events: None,
            deadline: None,
            snapshot,
        };
        let handle = CallHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        };
        (orchestrator, handle)
    }

    pub async fn run(mut self) {
        info!(target: "Calls/Orchestrator", "Orchestrator for {} started", self.me);
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Local { input, reply }) => {
                        let result = self.handle_local(input).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(received) = self.envelopes.recv() => self.handle_envelope(received).await,
                Some(event) = next_media_event(&mut self.media_events) => {
                    self.handle_media_event(event).await
                }
                kind = wait_for(deadline) => {
                    info!(target: "Calls/Orchestrator", "{kind:?} timeout in {}", self.session.phase());
                    self.feed(CallInput::Timeout(kind)).await;
                }
            }
        }
        info!(target: "Calls/Orchestrator", "Orchestrator for {} stopped", self.me);
    }

    async fn shutdown(&mut self) {
        debug!(target: "Calls/Orchestrator", "Shutting down in {}", self.session.phase());
        self.feed(CallInput::Shutdown).await;
    }

    async fn handle_local(&mut self, input: CallInput) -> Result<(), CallError> {
        if let CallInput::PlaceCall { peer, .. } = &input {
            if *peer == self.me {
                return Err(CallError::SelfCall);
            }
        }
        let is_control = matches!(
            input,
            CallInput::SetAudioMuted(_)
                | CallInput::SetVideoOff(_)
                | CallInput::SwitchCamera
                | CallInput::StartScreenShare(_)
                | CallInput::StopScreenShare
        );
        let is_place_call = matches!(input, CallInput::PlaceCall { .. });
        let previous = self.session.clone();

        let result = self.step(input, true).await;
        // A toggle the engine refused, or a call request the relay never
        // took, leaves the session as it was.
        let revert = match &result {
            Err(CallError::Media(_)) => is_control,
            Err(CallError::Channel(_)) => is_place_call,
            _ => false,
        };
        if revert {
            self.session = previous;
            self.deadline = None;
            self.publish();
        }
        result
    }

    async fn handle_envelope(&mut self, received: Result<Envelope, EnvelopeError>) {
        let envelope = match received {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Calls/Orchestrator", "Discarding malformed envelope: {e}");
                return;
            }
        };
        self.event_bus
            .dispatch(&Event::SignalReceived(envelope.clone()));

        if envelope.target != self.me.as_str() {
            warn!(
                target: "Calls/Orchestrator",
                "Discarding {} addressed to {:?}", envelope.kind, envelope.target
            );
            return;
        }
        let from = match envelope.sender_id() {
            Ok(from) => from,
            Err(e) => {
                warn!(target: "Calls/Orchestrator", "Discarding {}: {e}", envelope.kind);
                return;
            }
        };
        let signal = match envelope.signal() {
            Ok(signal) => signal,
            Err(e) => {
                warn!(target: "Calls/Orchestrator", "Discarding {} from {from}: {e}", envelope.kind);
                return;
            }
        };
        debug!(target: "Calls/Orchestrator", "Received {} from {from}", envelope.kind);
        self.feed(CallInput::Remote { from, signal }).await;
    }

    async fn handle_media_event(&mut self, event: MediaEvent) {
        let input = match event {
            MediaEvent::IceCandidate(candidate) => CallInput::LocalIce(candidate),
            MediaEvent::RemoteStream { stream_id } => CallInput::RemoteStream { stream_id },
            MediaEvent::ConnectionState(state) => {
                debug!(target: "Calls/Orchestrator", "Media connection is {state}");
                CallInput::MediaState(state)
            }
        };
        self.feed(input).await;
    }

    /// Inputs nobody waits on: failures are logged inside `step`.
    async fn feed(&mut self, input: CallInput) {
        let _ = self.step(input, false).await;
    }

    /// Feed `input` to the session and perform the resulting actions, plus
    /// whatever follow-up inputs those actions produce.
    ///
    /// Only a caller-facing input (`caller_waiting`) reports errors; for
    /// everything else they are logged and, for failed sends, dispatched.
    async fn step(&mut self, input: CallInput, caller_waiting: bool) -> Result<(), CallError> {
        let mut queue = VecDeque::from([input]);
        let mut outcome = Ok(());
        let mut first = true;

        while let Some(input) = queue.pop_front() {
            let report_to_caller = caller_waiting && first && input.is_local_command();
            first = false;

            let phase_before = self.session.phase();
            let call_before = self.session.call_id().clone();
            let actions = match self.session.apply(input) {
                Ok(actions) => actions,
                Err(e) if report_to_caller => {
                    outcome = Err(e.into());
                    break;
                }
                Err(e) => {
                    debug!(target: "Calls/Orchestrator", "Ignoring input: {e}");
                    continue;
                }
            };
            self.rearm_timer(phase_before, &call_before);

            for action in actions {
                if let Err(e) = self.perform(action, report_to_caller, &mut queue).await {
                    if report_to_caller {
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                    } else {
                        error!(target: "Calls/Orchestrator", "Side effect failed: {e}");
                    }
                }
            }

            if self.session.phase() == CallPhase::Ending {
                queue.push_back(CallInput::TeardownComplete);
            }
            if phase_before != self.session.phase() {
                info!(
                    target: "Calls/Orchestrator",
                    "Call {}: {phase_before} -> {}", self.session.call_id(), self.session.phase()
                );
            }
        }

        self.publish();
        outcome
    }

    async fn perform(
        &mut self,
        action: CallAction,
        report_to_caller: bool,
        queue: &mut VecDeque<CallInput>,
    ) -> Result<(), CallError> {
        match action {
            CallAction::Send { to, signal } => self.send(&to, &signal, report_to_caller).await,
            CallAction::OpenAndOffer { peer, media } => match self.prepare_offer(&peer, media).await {
                Ok(offer) => self.send(&peer, &Signal::Offer(offer), report_to_caller).await,
                Err(e) => {
                    queue.push_back(CallInput::MediaState(PeerConnectionState::Failed));
                    Err(e.into())
                }
            },
            CallAction::OpenAndAnswer { peer, media, offer } => {
                match self.prepare_answer(&peer, media, &offer).await {
                    Ok(answer) => {
                        self.send(&peer, &Signal::Answer(answer), report_to_caller)
                            .await
                    }
                    Err(e) => {
                        queue.push_back(CallInput::MediaState(PeerConnectionState::Failed));
                        Err(e.into())
                    }
                }
            }
            CallAction::ApplyRemoteDescription(description) => {
                Ok(self.media.set_remote_description(&description).await?)
            }
            CallAction::AddIceCandidate(candidate) => {
                Ok(self.media.add_ice_candidate(&candidate).await?)
            }
            CallAction::SetStatus(status) => {
                self.channel.set_status(status).await?;
                self.event_bus.dispatch(&Event::StatusChanged(StatusChanged {
                    user: self.me.clone(),
                    status,
                }));
                Ok(())
            }
            CallAction::ClearMailbox => Ok(self.channel.clear_mailbox().await?),
            CallAction::CloseMedia => {
                self.media.close().await;
                self.media_events = None;
                Ok(())
            }
            CallAction::SetAudioMuted(muted) => Ok(self.media.set_audio_muted(muted).await?),
            CallAction::SetVideoMuted(muted) => Ok(self.media.set_video_muted(muted).await?),
            CallAction::SwitchCamera => Ok(self.media.switch_camera().await?),
            CallAction::StartScreenCapture(token) => {
                Ok(self.media.start_screen_capture(&token).await?)
            }
            CallAction::StopScreenCapture => Ok(self.media.stop_screen_capture().await?),
            CallAction::Emit(event) => {
                self.event_bus.dispatch(&event);
                Ok(())
            }
        }
    }

    async fn open_media(&mut self, peer: &UserId, media: CallMedia) -> Result<(), MediaError> {
        let (events_tx, events_rx) = mpsc::channel(self.config.command_buffer);
        self.media.open(peer, media, events_tx).await?;
        self.media_events = Some(events_rx);
        Ok(())
    }

    async fn prepare_offer(
        &mut self,
        peer: &UserId,
        media: CallMedia,
    ) -> Result<SessionDescription, MediaError> {
        self.open_media(peer, media).await?;
        self.media.create_offer(peer).await
    }

    async fn prepare_answer(
        &mut self,
        peer: &UserId,
        media: CallMedia,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        self.open_media(peer, media).await?;
        self.media.set_remote_description(offer).await?;
        self.media.create_answer(peer).await
    }

    async fn send(
        &self,
        to: &UserId,
        signal: &Signal,
        report_to_caller: bool,
    ) -> Result<(), CallError> {
        match self.channel.send_signal(to, signal).await {
            Ok(()) => Ok(()),
            Err(e) if report_to_caller => Err(e.into()),
            Err(e) => {
                self.report_send_failure(to, signal, &e);
                Ok(())
            }
        }
    }

    fn report_send_failure(&self, to: &UserId, signal: &Signal, error: &ChannelError) {
        warn!(
            target: "Calls/Orchestrator",
            "Failed to send {} to {to}: {error}", signal.signal_type()
        );
        self.event_bus
            .dispatch(&Event::SignalSendFailed(SignalSendFailed {
                target: to.clone(),
                kind: signal.signal_type(),
                error: error.to_string(),
            }));
    }

    /// Restart the phase timer when the phase (or the call) changed.
    fn rearm_timer(&mut self, phase_before: CallPhase, call_before: &CallId) {
        if phase_before == self.session.phase() && call_before == self.session.call_id() {
            return;
        }
        self.deadline = self.session.state().timeout().map(|kind| {
            let after = match kind {
                TimeoutKind::Ring => self.config.ring_timeout,
                TimeoutKind::Negotiation => self.config.negotiation_timeout,
            };
            (Instant::now() + after, kind)
        });
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.session.snapshot());
    }
}

async fn next_media_event(events: &mut Option<mpsc::Receiver<MediaEvent>>) -> Option<MediaEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_for(deadline: Option<(Instant, TimeoutKind)>) -> TimeoutKind {
    match deadline {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}
