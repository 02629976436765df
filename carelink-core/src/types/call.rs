use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random identifier attached to one call session, used to correlate log
/// lines and listener events on both ends of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 32 uppercase hex characters, same shape as the ids used by WebRTC
    /// call stacks.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a call was placed by this client or received from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallMedia {
    Audio,
    #[default]
    Video,
}

impl CallMedia {
    pub fn is_video(self) -> bool {
        self == Self::Video
    }
}

impl fmt::Display for CallMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Coarse phase of the call session, without the per-phase data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallPhase {
    #[default]
    Idle,
    /// We placed a call and wait for the peer to pick up.
    Requesting,
    /// A peer called us and we have not answered yet.
    Ringing,
    /// Offer/answer/ICE exchange in progress.
    Negotiating,
    Connected,
    /// Transient teardown after the media connection dropped.
    Ending,
}

impl CallPhase {
    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Requesting => "REQUESTING",
            Self::Ringing => "RINGING",
            Self::Negotiating => "NEGOTIATING",
            Self::Connected => "CONNECTED",
            Self::Ending => "ENDING",
        };
        f.write_str(name)
    }
}
