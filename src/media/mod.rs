//! Contract between the call orchestrator and the peer-to-peer media engine.
//!
//! The engine (codec negotiation, NAT traversal, bandwidth adaptation) lives
//! outside this crate. The orchestrator drives it through [`MediaTransport`]
//! and hears back through [`MediaEvent`]s pushed into the sender handed to
//! [`MediaTransport::open`].

pub mod loopback;

use async_trait::async_trait;
use carelink_core::{CallMedia, IceCandidate, SessionDescription, UserId};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub use loopback::LoopbackMedia;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no peer connection is open")]
    NoConnection,
    #[error("failed to create session description: {0}")]
    Description(String),
    #[error("remote description rejected: {0}")]
    RemoteDescription(String),
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),
    #[error("screen capture unavailable: {0}")]
    ScreenCapture(String),
}

/// Connection states reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Observer callbacks of the media engine, delivered as messages.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A local candidate to forward to the peer.
    IceCandidate(IceCandidate),
    /// A remote media stream is ready to be rendered.
    RemoteStream { stream_id: String },
    ConnectionState(PeerConnectionState),
}

/// OS-issued permission to capture the screen, obtained by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenCaptureToken(pub String);

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create the peer connection for a call with `peer` and attach local
    /// capture. Engine callbacks go to `events` until [`close`](Self::close).
    async fn open(
        &self,
        peer: &UserId,
        media: CallMedia,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<(), MediaError>;

    async fn create_offer(&self, peer: &UserId) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self, peer: &UserId) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Tear down the peer connection. Safe to call when nothing is open.
    async fn close(&self);

    async fn set_audio_muted(&self, muted: bool) -> Result<(), MediaError>;

    async fn set_video_muted(&self, muted: bool) -> Result<(), MediaError>;

    async fn switch_camera(&self) -> Result<(), MediaError>;

    async fn start_screen_capture(&self, token: &ScreenCaptureToken) -> Result<(), MediaError>;

    async fn stop_screen_capture(&self) -> Result<(), MediaError>;
}
