//! Test doubles for the crate's unit and scenario tests.

use crate::media::{MediaError, MediaEvent, MediaTransport, PeerConnectionState, ScreenCaptureToken};
use crate::relay::InMemoryRelay;
use async_trait::async_trait;
use carelink_core::{
    CallMedia, Event, EventHandler, IceCandidate, RelayPaths, SessionDescription, UserId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_WAIT: Duration = Duration::from_secs(120);

pub fn user(id: &str) -> UserId {
    id.parse().expect("test user id should be valid")
}

/// An in-memory relay with `users` already registered (status OFFLINE).
pub fn relay_with_users(users: &[&UserId]) -> InMemoryRelay {
    let relay = InMemoryRelay::new();
    for user in users {
        relay.register_user(&RelayPaths::default(), user);
    }
    relay
}

/// Every call the orchestrator made on the media engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaCall {
    Open { peer: UserId, media: CallMedia },
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    Close,
    SetAudioMuted(bool),
    SetVideoMuted(bool),
    SwitchCamera,
    StartScreenCapture,
    StopScreenCapture,
}

/// Media engine that records what it was asked to do and only reports
/// connection changes when the test says so.
#[derive(Default)]
pub struct RecordingMedia {
    calls: Mutex<Vec<MediaCall>>,
    events: Mutex<Option<mpsc::Sender<MediaEvent>>>,
    fail_offers: AtomicBool,
    fail_controls: AtomicBool,
}

impl RecordingMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().expect("mutex should not be poisoned").clone()
    }

    pub fn count(&self, predicate: impl Fn(&MediaCall) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_controls(&self, fail: bool) {
        self.fail_controls.store(fail, Ordering::SeqCst);
    }

    /// Push an engine callback to the orchestrator, as the real engine would.
    pub async fn emit(&self, event: MediaEvent) {
        let sender = self
            .events
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
            .expect("media connection should be open");
        sender
            .send(event)
            .await
            .expect("orchestrator should be listening");
    }

    pub async fn report(&self, state: PeerConnectionState) {
        self.emit(MediaEvent::ConnectionState(state)).await;
    }

    fn record(&self, call: MediaCall) {
        self.calls
            .lock()
            .expect("mutex should not be poisoned")
            .push(call);
    }

    fn control(&self, call: MediaCall) -> Result<(), MediaError> {
        if self.fail_controls.load(Ordering::SeqCst) {
            return Err(MediaError::NoConnection);
        }
        self.record(call);
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for RecordingMedia {
    async fn open(
        &self,
        peer: &UserId,
        media: CallMedia,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<(), MediaError> {
        self.record(MediaCall::Open {
            peer: peer.clone(),
            media,
        });
        *self.events.lock().expect("mutex should not be poisoned") = Some(events);
        Ok(())
    }

    async fn create_offer(&self, _peer: &UserId) -> Result<SessionDescription, MediaError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(MediaError::Description("camera unavailable".to_string()));
        }
        self.record(MediaCall::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\ns=recording offer"))
    }

    async fn create_answer(&self, _peer: &UserId) -> Result<SessionDescription, MediaError> {
        self.record(MediaCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\ns=recording answer"))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(MediaCall::SetRemoteDescription(description.clone()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.record(MediaCall::AddIceCandidate(candidate.clone()));
        Ok(())
    }

    async fn close(&self) {
        self.record(MediaCall::Close);
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .take();
    }

    async fn set_audio_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.control(MediaCall::SetAudioMuted(muted))
    }

    async fn set_video_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.control(MediaCall::SetVideoMuted(muted))
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.control(MediaCall::SwitchCamera)
    }

    async fn start_screen_capture(&self, _token: &ScreenCaptureToken) -> Result<(), MediaError> {
        self.control(MediaCall::StartScreenCapture)
    }

    async fn stop_screen_capture(&self) -> Result<(), MediaError> {
        self.control(MediaCall::StopScreenCapture)
    }
}

/// Forwards every dispatched event into a channel the test can await.
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventHandler for ChannelEventHandler {
    fn handle_event(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

/// Skip events until one matches.
pub async fn next_matching(
    events: &mut mpsc::UnboundedReceiver<Event>,
    predicate: impl Fn(&Event) -> bool,
) -> Event {
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus should stay open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event was not dispatched")
}

/// Drain what has been dispatched so far without waiting.
pub fn drain(events: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
