//! The signaling envelope written into a user's relay mailbox.
//!
//! On the wire an envelope is a flat JSON object:
//!
//! ```json
//! { "type": "Offer", "sender": "caregiver_7", "target": "viu_42", "data": "{\"type\":\"offer\",\"sdp\":\"v=0...\"}" }
//! ```
//!
//! `data` is itself a JSON string and is only present for `Offer`, `Answer`
//! and `IceCandidate`. [`Signal`] is the decoded, typed view of an envelope
//! that the orchestrator matches on.

use super::call::CallMedia;
use super::media::{IceCandidate, SdpType, SessionDescription};
use super::user::{InvalidUserId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The closed set of message types understood by both ends of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    StartVideoCall,
    StartAudioCall,
    Offer,
    Answer,
    IceCandidate,
    EndCall,
    DenyCall,
    AbortCall,
    MissCall,
}

impl SignalType {
    pub const ALL: [SignalType; 9] = [
        Self::StartVideoCall,
        Self::StartAudioCall,
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::EndCall,
        Self::DenyCall,
        Self::AbortCall,
        Self::MissCall,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartVideoCall => "StartVideoCall",
            Self::StartAudioCall => "StartAudioCall",
            Self::Offer => "Offer",
            Self::Answer => "Answer",
            Self::IceCandidate => "IceCandidate",
            Self::EndCall => "EndCall",
            Self::DenyCall => "DenyCall",
            Self::AbortCall => "AbortCall",
            Self::MissCall => "MissCall",
        }
    }

    /// Whether envelopes of this type must carry a `data` payload.
    pub const fn carries_data(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    /// End, deny, abort and miss all close the session on receipt.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::EndCall | Self::DenyCall | Self::AbortCall | Self::MissCall
        )
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("{0} envelope has no data")]
    MissingData(SignalType),
    #[error("{kind} envelope has undecodable data: {source}")]
    InvalidData {
        kind: SignalType,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} envelope carries a {found:?} session description")]
    SdpTypeMismatch { kind: SignalType, found: SdpType },
    #[error("envelope sender is invalid: {0}")]
    InvalidSender(#[source] InvalidUserId),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Wire form of a signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: SignalType,
    /// Filled in by the channel right before the write; whatever a caller
    /// puts here is overwritten.
    #[serde(default)]
    pub sender: String,
    pub target: String,
    #[serde(default)]
    pub data: Option<String>,
}

impl Envelope {
    /// Build an unsent envelope for `signal`. The sender stays empty until
    /// the channel stamps it.
    pub fn new(target: &UserId, signal: &Signal) -> Result<Self, EnvelopeError> {
        Ok(Self {
            kind: signal.signal_type(),
            sender: String::new(),
            target: target.to_string(),
            data: signal.encode_data()?,
        })
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Malformed)
    }

    pub fn sender_id(&self) -> Result<UserId, EnvelopeError> {
        UserId::new(self.sender.as_str()).map_err(EnvelopeError::InvalidSender)
    }

    /// Decode the typed signal, including its payload.
    pub fn signal(&self) -> Result<Signal, EnvelopeError> {
        let kind = self.kind;
        let signal = match kind {
            SignalType::StartVideoCall => Signal::StartCall(CallMedia::Video),
            SignalType::StartAudioCall => Signal::StartCall(CallMedia::Audio),
            SignalType::Offer => Signal::Offer(self.session_description(SdpType::Offer)?),
            SignalType::Answer => Signal::Answer(self.session_description(SdpType::Answer)?),
            SignalType::IceCandidate => {
                let raw = self.data.as_deref().ok_or(EnvelopeError::MissingData(kind))?;
                let candidate = serde_json::from_str(raw)
                    .map_err(|source| EnvelopeError::InvalidData { kind, source })?;
                Signal::IceCandidate(candidate)
            }
            SignalType::EndCall => Signal::EndCall,
            SignalType::DenyCall => Signal::DenyCall,
            SignalType::AbortCall => Signal::AbortCall,
            SignalType::MissCall => Signal::MissCall,
        };
        Ok(signal)
    }

    fn session_description(&self, expected: SdpType) -> Result<SessionDescription, EnvelopeError> {
        let kind = self.kind;
        let raw = self.data.as_deref().ok_or(EnvelopeError::MissingData(kind))?;
        let description: SessionDescription = serde_json::from_str(raw)
            .map_err(|source| EnvelopeError::InvalidData { kind, source })?;
        if description.sdp_type != expected {
            return Err(EnvelopeError::SdpTypeMismatch {
                kind,
                found: description.sdp_type,
            });
        }
        Ok(description)
    }
}

/// Decoded signal, one variant per [`SignalType`] (both start types fold
/// into `StartCall`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    StartCall(CallMedia),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    EndCall,
    DenyCall,
    AbortCall,
    MissCall,
}

impl Signal {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::StartCall(CallMedia::Video) => SignalType::StartVideoCall,
            Self::StartCall(CallMedia::Audio) => SignalType::StartAudioCall,
            Self::Offer(_) => SignalType::Offer,
            Self::Answer(_) => SignalType::Answer,
            Self::IceCandidate(_) => SignalType::IceCandidate,
            Self::EndCall => SignalType::EndCall,
            Self::DenyCall => SignalType::DenyCall,
            Self::AbortCall => SignalType::AbortCall,
            Self::MissCall => SignalType::MissCall,
        }
    }

    fn encode_data(&self) -> Result<Option<String>, EnvelopeError> {
        let encoded = match self {
            Self::Offer(description) | Self::Answer(description) => {
                serde_json::to_string(description)
            }
            Self::IceCandidate(candidate) => serde_json::to_string(candidate),
            _ => return Ok(None),
        };
        encoded.map(Some).map_err(EnvelopeError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viu() -> UserId {
        "viu_42".parse().unwrap()
    }

    #[test]
    fn wire_shape_matches_relay_schema() {
        let envelope = Envelope::new(&viu(), &Signal::StartCall(CallMedia::Video)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "StartVideoCall");
        assert_eq!(json["sender"], "");
        assert_eq!(json["target"], "viu_42");
        assert!(json["data"].is_null());
    }

    #[test]
    fn only_negotiation_types_carry_data() {
        let with_data: Vec<_> = SignalType::ALL
            .iter()
            .filter(|kind| kind.carries_data())
            .collect();
        assert_eq!(
            with_data,
            [
                &SignalType::Offer,
                &SignalType::Answer,
                &SignalType::IceCandidate
            ]
        );
    }

    #[test]
    fn json_round_trip_keeps_type_target_and_data() {
        let signals = [
            Signal::StartCall(CallMedia::Audio),
            Signal::Offer(SessionDescription::offer("v=0\r\no=- 1 2 IN IP4 127.0.0.1")),
            Signal::Answer(SessionDescription::answer("v=0")),
            Signal::IceCandidate(IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 9 typ host")),
            Signal::EndCall,
            Signal::MissCall,
        ];
        for signal in signals {
            let mut sent = Envelope::new(&viu(), &signal).unwrap();
            sent.sender = "caregiver_7".to_string();
            let received = Envelope::from_json(&sent.to_json().unwrap()).unwrap();
            assert_eq!(received.kind, sent.kind);
            assert_eq!(received.target, sent.target);
            assert_eq!(received.data, sent.data);
            assert_eq!(received.signal().unwrap(), signal);
        }
    }

    #[test]
    fn unknown_type_is_malformed() {
        let raw = r#"{"type":"Ping","sender":"a","target":"b","data":null}"#;
        assert!(matches!(
            Envelope::from_json(raw),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn corrupted_ice_payload_is_reported_not_panicked() {
        let envelope = Envelope {
            kind: SignalType::IceCandidate,
            sender: "caregiver_7".into(),
            target: "viu_42".into(),
            data: Some("{not json".into()),
        };
        assert!(matches!(
            envelope.signal(),
            Err(EnvelopeError::InvalidData {
                kind: SignalType::IceCandidate,
                ..
            })
        ));
    }

    #[test]
    fn offer_without_data_is_rejected() {
        let envelope = Envelope {
            kind: SignalType::Offer,
            sender: "caregiver_7".into(),
            target: "viu_42".into(),
            data: None,
        };
        assert!(matches!(
            envelope.signal(),
            Err(EnvelopeError::MissingData(SignalType::Offer))
        ));
    }

    #[test]
    fn answer_payload_inside_offer_envelope_is_rejected() {
        let mut envelope =
            Envelope::new(&viu(), &Signal::Answer(SessionDescription::answer("v=0"))).unwrap();
        envelope.kind = SignalType::Offer;
        assert!(matches!(
            envelope.signal(),
            Err(EnvelopeError::SdpTypeMismatch { .. })
        ));
    }

    #[test]
    fn missing_sender_fails_identity_check() {
        let envelope = Envelope::new(&viu(), &Signal::EndCall).unwrap();
        assert!(matches!(
            envelope.sender_id(),
            Err(EnvelopeError::InvalidSender(InvalidUserId::Empty))
        ));
    }
}
