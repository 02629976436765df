use super::{MediaError, MediaEvent, MediaTransport, PeerConnectionState, ScreenCaptureToken};
use async_trait::async_trait;
use carelink_core::{CallMedia, IceCandidate, SdpType, SessionDescription, UserId};
use log::{debug, warn};
use rand::Rng;
use tokio::sync::{Mutex, mpsc};

/// Media engine stand-in that fabricates descriptions and reports the
/// connection as established once both descriptions are in place.
///
/// Used by the demo binary and the end-to-end tests; it moves no media.
#[derive(Default)]
pub struct LoopbackMedia {
    candidates_per_description: usize,
    connection: Mutex<Option<LoopbackConnection>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackControls {
    pub audio_muted: bool,
    pub video_muted: bool,
    pub front_camera: bool,
    pub screen_sharing: bool,
}

struct LoopbackConnection {
    peer: UserId,
    media: CallMedia,
    events: mpsc::Sender<MediaEvent>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    connected: bool,
    controls: LoopbackControls,
}

impl LoopbackConnection {
    fn emit(&self, event: MediaEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(target: "Media/Loopback", "Dropping media event: {e}");
        }
    }

    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let session: u64 = rand::rng().random();
        let mut sdp = format!(
            "v=0\r\no=carelink {session} 2 IN IP4 127.0.0.1\r\ns=loopback {}\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.peer
        );
        if self.media.is_video() {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        SessionDescription { sdp_type, sdp }
    }

    fn gather(&self, count: usize) {
        let mut rng = rand::rng();
        for index in 0..count {
            let port: u16 = rng.random_range(49152..=65535);
            self.emit(MediaEvent::IceCandidate(
                IceCandidate::new(format!(
                    "candidate:{index} 1 UDP 2130706431 127.0.0.1 {port} typ host"
                ))
                .with_sdp_mid("0")
                .with_sdp_m_line_index(0),
            ));
        }
    }

    fn maybe_connect(&mut self) {
        if self.connected || self.local.is_none() || self.remote.is_none() {
            return;
        }
        self.connected = true;
        self.emit(MediaEvent::ConnectionState(PeerConnectionState::Connecting));
        self.emit(MediaEvent::RemoteStream {
            stream_id: format!("{}-stream", self.peer),
        });
        self.emit(MediaEvent::ConnectionState(PeerConnectionState::Connected));
    }
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `count` host candidates every time a local description is made.
    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidates_per_description = count;
        self
    }

    /// Push a connection-state change as if the network did it.
    pub async fn simulate_state(&self, state: PeerConnectionState) {
        if let Some(conn) = self.connection.lock().await.as_ref() {
            conn.emit(MediaEvent::ConnectionState(state));
        }
    }

    pub async fn is_open(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    pub async fn controls(&self) -> Option<LoopbackControls> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.controls.clone())
    }

    async fn local_description(
        &self,
        peer: &UserId,
        sdp_type: SdpType,
    ) -> Result<SessionDescription, MediaError> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(MediaError::NoConnection)?;
        if &conn.peer != peer {
            return Err(MediaError::Description(format!(
                "connection is for {}, not {peer}",
                conn.peer
            )));
        }
        if sdp_type == SdpType::Answer && conn.remote.is_none() {
            return Err(MediaError::Description(
                "cannot answer before a remote offer".to_string(),
            ));
        }
        let description = conn.describe(sdp_type);
        conn.local = Some(description.clone());
        conn.gather(self.candidates_per_description);
        conn.maybe_connect();
        Ok(description)
    }

    async fn with_connection<F>(&self, f: F) -> Result<(), MediaError>
    where
        F: FnOnce(&mut LoopbackConnection),
    {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(MediaError::NoConnection)?;
        f(conn);
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for LoopbackMedia {
    async fn open(
        &self,
        peer: &UserId,
        media: CallMedia,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<(), MediaError> {
        debug!(target: "Media/Loopback", "Opening {media} connection to {peer}");
        *self.connection.lock().await = Some(LoopbackConnection {
            peer: peer.clone(),
            media,
            events,
            local: None,
            remote: None,
            connected: false,
            controls: LoopbackControls {
                video_muted: !media.is_video(),
                front_camera: true,
                ..Default::default()
            },
        });
        Ok(())
    }

    async fn create_offer(&self, peer: &UserId) -> Result<SessionDescription, MediaError> {
        self.local_description(peer, SdpType::Offer).await
    }

    async fn create_answer(&self, peer: &UserId) -> Result<SessionDescription, MediaError> {
        self.local_description(peer, SdpType::Answer).await
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        if !description.sdp.starts_with("v=0") {
            return Err(MediaError::RemoteDescription(
                "description does not start with v=0".to_string(),
            ));
        }
        self.with_connection(|conn| {
            conn.remote = Some(description.clone());
            conn.maybe_connect();
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(MediaError::Candidate(candidate.candidate.clone()));
        }
        self.with_connection(|_| {}).await
    }

    async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            debug!(target: "Media/Loopback", "Closing connection to {}", conn.peer);
            conn.emit(MediaEvent::ConnectionState(PeerConnectionState::Closed));
        }
    }

    async fn set_audio_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.with_connection(|conn| conn.controls.audio_muted = muted)
            .await
    }

    async fn set_video_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.with_connection(|conn| conn.controls.video_muted = muted)
            .await
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.with_connection(|conn| conn.controls.front_camera = !conn.controls.front_camera)
            .await
    }

    async fn start_screen_capture(&self, token: &ScreenCaptureToken) -> Result<(), MediaError> {
        if token.0.is_empty() {
            return Err(MediaError::ScreenCapture("empty permission token".to_string()));
        }
        self.with_connection(|conn| conn.controls.screen_sharing = true)
            .await
    }

    async fn stop_screen_capture(&self) -> Result<(), MediaError> {
        self.with_connection(|conn| conn.controls.screen_sharing = false)
            .await
    }
}
