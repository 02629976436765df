//! Call session state machine.
//!
//! [`CallSession::apply`] is total over (state, input): it either moves the
//! session and returns the side effects to perform, in order, or returns an
//! [`InvalidTransition`] and leaves the session untouched.

use crate::media::{PeerConnectionState, ScreenCaptureToken};
use carelink_core::types::events::{CallClosed, CallConnected, IncomingCall, RemoteStreamAttached};
use carelink_core::{
    CallDirection, CallId, CallMedia, CallPhase, Event, IceCandidate, PresenceStatus,
    SessionDescription, Signal, UserId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Current state of the (single) call session.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// We sent a start signal and wait for the peer's offer.
    Requesting {
        peer: UserId,
        media: CallMedia,
        requested_at: DateTime<Utc>,
    },
    /// The peer called us; waiting for a local accept or decline.
    Ringing {
        peer: UserId,
        media: CallMedia,
        received_at: DateTime<Utc>,
    },
    /// Offer/answer/ICE exchange. The callee creates the offer, so an
    /// `Outgoing` session expects an Offer and an `Incoming` one an Answer.
    Negotiating {
        peer: UserId,
        media: CallMedia,
        direction: CallDirection,
        accepted_at: DateTime<Utc>,
    },
    Connected {
        peer: UserId,
        media: CallMedia,
        direction: CallDirection,
        connected_at: DateTime<Utc>,
        audio_muted: bool,
        video_off: bool,
        screen_sharing: bool,
    },
    /// Media dropped; local teardown in progress.
    Ending { peer: UserId },
}

impl CallState {
    pub fn phase(&self) -> CallPhase {
        match self {
            Self::Idle => CallPhase::Idle,
            Self::Requesting { .. } => CallPhase::Requesting,
            Self::Ringing { .. } => CallPhase::Ringing,
            Self::Negotiating { .. } => CallPhase::Negotiating,
            Self::Connected { .. } => CallPhase::Connected,
            Self::Ending { .. } => CallPhase::Ending,
        }
    }

    pub fn peer(&self) -> Option<&UserId> {
        match self {
            Self::Idle => None,
            Self::Requesting { peer, .. }
            | Self::Ringing { peer, .. }
            | Self::Negotiating { peer, .. }
            | Self::Connected { peer, .. }
            | Self::Ending { peer } => Some(peer),
        }
    }

    pub fn direction(&self) -> Option<CallDirection> {
        match self {
            Self::Requesting { .. } => Some(CallDirection::Outgoing),
            Self::Ringing { .. } => Some(CallDirection::Incoming),
            Self::Negotiating { direction, .. } | Self::Connected { direction, .. } => {
                Some(*direction)
            }
            Self::Idle | Self::Ending { .. } => None,
        }
    }

    /// Which timer guards this state, if any.
    pub fn timeout(&self) -> Option<TimeoutKind> {
        match self {
            Self::Requesting { .. } | Self::Ringing { .. } => Some(TimeoutKind::Ring),
            Self::Negotiating { .. } => Some(TimeoutKind::Negotiation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimeoutKind {
    /// Nobody picked up.
    Ring,
    /// Offer/answer/ICE did not produce a connection.
    Negotiation,
}

/// Everything that can drive the session.
#[derive(Debug, Clone)]
pub enum CallInput {
    PlaceCall { peer: UserId, media: CallMedia },
    Accept,
    Decline,
    HangUp,
    /// A decoded envelope from our mailbox.
    Remote { from: UserId, signal: Signal },
    /// The media engine produced a local candidate.
    LocalIce(IceCandidate),
    MediaState(PeerConnectionState),
    RemoteStream { stream_id: String },
    Timeout(TimeoutKind),
    TeardownComplete,
    SetAudioMuted(bool),
    SetVideoOff(bool),
    SwitchCamera,
    StartScreenShare(ScreenCaptureToken),
    StopScreenShare,
    /// The session owner is going away.
    Shutdown,
}

impl CallInput {
    /// Local commands report invalid transitions to the caller; everything
    /// else is silently discarded.
    pub fn is_local_command(&self) -> bool {
        matches!(
            self,
            Self::PlaceCall { .. }
                | Self::Accept
                | Self::Decline
                | Self::HangUp
                | Self::SetAudioMuted(_)
                | Self::SetVideoOff(_)
                | Self::SwitchCamera
                | Self::StartScreenShare(_)
                | Self::StopScreenShare
        )
    }
}

impl fmt::Display for CallInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlaceCall { peer, media } => write!(f, "PlaceCall({media} to {peer})"),
            Self::Remote { from, signal } => {
                write!(f, "Remote({} from {from})", signal.signal_type())
            }
            Self::LocalIce(_) => f.write_str("LocalIce"),
            Self::MediaState(state) => write!(f, "MediaState({state})"),
            Self::RemoteStream { stream_id } => write!(f, "RemoteStream({stream_id})"),
            Self::Timeout(kind) => write!(f, "Timeout({kind:?})"),
            Self::StartScreenShare(_) => f.write_str("StartScreenShare"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone)]
pub enum CallAction {
    Send { to: UserId, signal: Signal },
    /// Open the peer connection, create an offer and send it.
    OpenAndOffer { peer: UserId, media: CallMedia },
    /// Open the peer connection, apply the remote offer, create and send the
    /// answer.
    OpenAndAnswer {
        peer: UserId,
        media: CallMedia,
        offer: SessionDescription,
    },
    ApplyRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    SetStatus(PresenceStatus),
    ClearMailbox,
    CloseMedia,
    SetAudioMuted(bool),
    SetVideoMuted(bool),
    SwitchCamera,
    StartScreenCapture(ScreenCaptureToken),
    StopScreenCapture,
    Emit(Event),
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: CallPhase,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Read-only view of the session for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub call_id: Option<CallId>,
    pub phase: CallPhase,
    pub peer: Option<UserId>,
    pub direction: Option<CallDirection>,
    pub media: Option<CallMedia>,
    pub audio_muted: bool,
    pub video_off: bool,
    pub screen_sharing: bool,
}

struct Step {
    next: Option<CallState>,
    call_id: Option<CallId>,
    actions: Vec<CallAction>,
}

impl Step {
    fn to(next: CallState, actions: Vec<CallAction>) -> Self {
        Self {
            next: Some(next),
            call_id: None,
            actions,
        }
    }

    fn stay(actions: Vec<CallAction>) -> Self {
        Self {
            next: None,
            call_id: None,
            actions,
        }
    }
}

/// The Call Session: state plus the id of the current (or last) call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    call_id: CallId,
    state: CallState,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            call_id: CallId::generate(),
            state: CallState::Idle,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn phase(&self) -> CallPhase {
        self.state.phase()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let (media, audio_muted, video_off, screen_sharing) = match &self.state {
            CallState::Requesting { media, .. }
            | CallState::Ringing { media, .. }
            | CallState::Negotiating { media, .. } => (Some(*media), false, !media.is_video(), false),
            CallState::Connected {
                media,
                audio_muted,
                video_off,
                screen_sharing,
                ..
            } => (Some(*media), *audio_muted, *video_off, *screen_sharing),
            CallState::Idle | CallState::Ending { .. } => (None, false, false, false),
        };
        CallSnapshot {
            call_id: (!self.phase().is_idle()).then(|| self.call_id.clone()),
            phase: self.phase(),
            peer: self.state.peer().cloned(),
            direction: self.state.direction(),
            media,
            audio_muted,
            video_off,
            screen_sharing,
        }
    }

    pub fn apply(&mut self, input: CallInput) -> Result<Vec<CallAction>, InvalidTransition> {
        let attempted = input.to_string();
        let now = Utc::now();
        let step = match &self.state {
            CallState::Idle => self.on_idle(input, now),
            CallState::Requesting { peer, media, .. } => {
                self.on_requesting(peer, *media, input, now)
            }
            CallState::Ringing { peer, media, .. } => self.on_ringing(peer, *media, input, now),
            CallState::Negotiating {
                peer,
                media,
                direction,
                ..
            } => self.on_negotiating(peer, *media, *direction, input, now),
            CallState::Connected { .. } => self.on_connected(input, now),
            CallState::Ending { .. } => match input {
                CallInput::TeardownComplete => Some(Step::to(CallState::Idle, vec![])),
                CallInput::Shutdown => Some(Step::to(CallState::Idle, vec![CallAction::CloseMedia])),
                _ => None,
            },
        };

        let Some(step) = step else {
            return Err(InvalidTransition {
                current_state: self.phase(),
                attempted,
            });
        };
        if let Some(call_id) = step.call_id {
            self.call_id = call_id;
        }
        if let Some(next) = step.next {
            self.state = next;
        }
        Ok(step.actions)
    }

    fn closed(&self, peer: &UserId, now: DateTime<Utc>, connected_at: Option<DateTime<Utc>>) -> CallClosed {
        CallClosed {
            call_id: self.call_id.clone(),
            peer: peer.clone(),
            closed_at: now,
            duration_secs: connected_at.map(|at| now.signed_duration_since(at).num_seconds()),
        }
    }

    /// Event for a terminal signal received from the peer in `phase`.
    fn remote_end_event(&self, signal: &Signal, closed: CallClosed) -> Option<Event> {
        let phase = self.phase();
        let event = match signal {
            Signal::EndCall if phase != CallPhase::Ringing => Event::CallEnded(closed),
            Signal::DenyCall if phase != CallPhase::Ringing => Event::CallDenied(closed),
            Signal::AbortCall => Event::CallAborted(closed),
            // The callee's ring timer fired before ours.
            Signal::MissCall if phase == CallPhase::Requesting => Event::CallUnanswered(closed),
            Signal::MissCall => Event::CallMissed(closed),
            _ => return None,
        };
        Some(event)
    }

    fn on_idle(&self, input: CallInput, now: DateTime<Utc>) -> Option<Step> {
        match input {
            CallInput::PlaceCall { peer, media } => {
                let mut step = Step::to(
                    CallState::Requesting {
                        peer: peer.clone(),
                        media,
                        requested_at: now,
                    },
                    vec![CallAction::Send {
                        to: peer,
                        signal: Signal::StartCall(media),
                    }],
                );
                step.call_id = Some(CallId::generate());
                Some(step)
            }
            CallInput::Remote {
                from,
                signal: Signal::StartCall(media),
            } => {
                let call_id = CallId::generate();
                let event = Event::IncomingCall(IncomingCall {
                    call_id: call_id.clone(),
                    from: from.clone(),
                    media,
                    received_at: now,
                });
                let mut step = Step::to(
                    CallState::Ringing {
                        peer: from,
                        media,
                        received_at: now,
                    },
                    vec![CallAction::Emit(event)],
                );
                step.call_id = Some(call_id);
                Some(step)
            }
            CallInput::Shutdown => Some(Step::stay(vec![CallAction::CloseMedia])),
            _ => None,
        }
    }

    fn on_requesting(
        &self,
        peer: &UserId,
        media: CallMedia,
        input: CallInput,
        now: DateTime<Utc>,
    ) -> Option<Step> {
        match input {
            CallInput::Remote { from, signal } if &from == peer => match signal {
                Signal::Offer(offer) => Some(Step::to(
                    CallState::Negotiating {
                        peer: peer.clone(),
                        media,
                        direction: CallDirection::Outgoing,
                        accepted_at: now,
                    },
                    vec![CallAction::OpenAndAnswer {
                        peer: peer.clone(),
                        media,
                        offer,
                    }],
                )),
                signal => {
                    let event = self.remote_end_event(&signal, self.closed(peer, now, None))?;
                    Some(Step::to(
                        CallState::Idle,
                        vec![
                            CallAction::CloseMedia,
                            CallAction::ClearMailbox,
                            CallAction::Emit(event),
                        ],
                    ))
                }
            },
            CallInput::HangUp | CallInput::Shutdown => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::AbortCall,
                    },
                    CallAction::CloseMedia,
                ],
            )),
            CallInput::Timeout(TimeoutKind::Ring) => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::MissCall,
                    },
                    CallAction::CloseMedia,
                    CallAction::Emit(Event::CallUnanswered(self.closed(peer, now, None))),
                ],
            )),
            _ => None,
        }
    }

    fn on_ringing(
        &self,
        peer: &UserId,
        media: CallMedia,
        input: CallInput,
        now: DateTime<Utc>,
    ) -> Option<Step> {
        match input {
            CallInput::Accept => Some(Step::to(
                CallState::Negotiating {
                    peer: peer.clone(),
                    media,
                    direction: CallDirection::Incoming,
                    accepted_at: now,
                },
                vec![CallAction::OpenAndOffer {
                    peer: peer.clone(),
                    media,
                }],
            )),
            CallInput::Decline => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::DenyCall,
                    },
                    CallAction::ClearMailbox,
                ],
            )),
            CallInput::Remote { from, signal } if &from == peer => {
                let event = self.remote_end_event(&signal, self.closed(peer, now, None))?;
                Some(Step::to(
                    CallState::Idle,
                    vec![
                        CallAction::CloseMedia,
                        CallAction::ClearMailbox,
                        CallAction::Emit(event),
                    ],
                ))
            }
            CallInput::Timeout(TimeoutKind::Ring) => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::MissCall,
                    },
                    CallAction::ClearMailbox,
                    CallAction::Emit(Event::CallMissed(self.closed(peer, now, None))),
                ],
            )),
            // Leaving before pickup counts as a missed call for the caller.
            CallInput::Shutdown => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::MissCall,
                    },
                    CallAction::CloseMedia,
                ],
            )),
            _ => None,
        }
    }

    fn on_negotiating(
        &self,
        peer: &UserId,
        media: CallMedia,
        direction: CallDirection,
        input: CallInput,
        now: DateTime<Utc>,
    ) -> Option<Step> {
        match input {
            CallInput::Remote { from, signal } if &from == peer => match signal {
                // A repeated offer only refreshes the remote description.
                Signal::Offer(offer) if direction == CallDirection::Outgoing => {
                    Some(Step::stay(vec![CallAction::ApplyRemoteDescription(offer)]))
                }
                Signal::Answer(answer) if direction == CallDirection::Incoming => {
                    Some(Step::stay(vec![CallAction::ApplyRemoteDescription(answer)]))
                }
                Signal::IceCandidate(candidate) => {
                    Some(Step::stay(vec![CallAction::AddIceCandidate(candidate)]))
                }
                signal => {
                    let event = self.remote_end_event(&signal, self.closed(peer, now, None))?;
                    Some(Step::to(
                        CallState::Idle,
                        vec![
                            CallAction::CloseMedia,
                            CallAction::ClearMailbox,
                            CallAction::Emit(event),
                        ],
                    ))
                }
            },
            CallInput::LocalIce(candidate) => Some(Step::stay(vec![CallAction::Send {
                to: peer.clone(),
                signal: Signal::IceCandidate(candidate),
            }])),
            CallInput::RemoteStream { stream_id } => Some(Step::stay(vec![CallAction::Emit(
                Event::RemoteStreamAttached(RemoteStreamAttached {
                    call_id: self.call_id.clone(),
                    peer: peer.clone(),
                    stream_id,
                }),
            )])),
            CallInput::MediaState(PeerConnectionState::Connected) => Some(Step::to(
                CallState::Connected {
                    peer: peer.clone(),
                    media,
                    direction,
                    connected_at: now,
                    audio_muted: false,
                    video_off: !media.is_video(),
                    screen_sharing: false,
                },
                vec![
                    CallAction::SetStatus(PresenceStatus::InCall),
                    CallAction::ClearMailbox,
                    CallAction::Emit(Event::CallConnected(CallConnected {
                        call_id: self.call_id.clone(),
                        peer: peer.clone(),
                        connected_at: now,
                    })),
                ],
            )),
            CallInput::MediaState(PeerConnectionState::Failed) => Some(Step::to(
                CallState::Ending { peer: peer.clone() },
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::EndCall,
                    },
                    CallAction::CloseMedia,
                    CallAction::Emit(Event::ConnectionLost(self.closed(peer, now, None))),
                ],
            )),
            CallInput::MediaState(_) => Some(Step::stay(vec![])),
            CallInput::HangUp | CallInput::Shutdown => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::EndCall,
                    },
                    CallAction::CloseMedia,
                ],
            )),
            CallInput::Timeout(TimeoutKind::Negotiation) => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::EndCall,
                    },
                    CallAction::CloseMedia,
                    CallAction::Emit(Event::NegotiationTimedOut(self.closed(peer, now, None))),
                ],
            )),
            _ => None,
        }
    }

    fn on_connected(&self, input: CallInput, now: DateTime<Utc>) -> Option<Step> {
        let CallState::Connected {
            peer,
            media,
            direction,
            connected_at,
            audio_muted,
            video_off,
            screen_sharing,
        } = &self.state
        else {
            return None;
        };
        let with_controls = |audio_muted: bool, video_off: bool, screen_sharing: bool| {
            CallState::Connected {
                peer: peer.clone(),
                media: *media,
                direction: *direction,
                connected_at: *connected_at,
                audio_muted,
                video_off,
                screen_sharing,
            }
        };

        match input {
            CallInput::Remote { from, signal } if &from == peer => match signal {
                Signal::IceCandidate(candidate) => {
                    Some(Step::stay(vec![CallAction::AddIceCandidate(candidate)]))
                }
                signal => {
                    let closed = self.closed(peer, now, Some(*connected_at));
                    let event = self.remote_end_event(&signal, closed)?;
                    Some(Step::to(
                        CallState::Idle,
                        vec![
                            CallAction::CloseMedia,
                            CallAction::SetStatus(PresenceStatus::Online),
                            CallAction::ClearMailbox,
                            CallAction::Emit(event),
                        ],
                    ))
                }
            },
            CallInput::LocalIce(candidate) => Some(Step::stay(vec![CallAction::Send {
                to: peer.clone(),
                signal: Signal::IceCandidate(candidate),
            }])),
            CallInput::RemoteStream { stream_id } => Some(Step::stay(vec![CallAction::Emit(
                Event::RemoteStreamAttached(RemoteStreamAttached {
                    call_id: self.call_id.clone(),
                    peer: peer.clone(),
                    stream_id,
                }),
            )])),
            CallInput::MediaState(PeerConnectionState::Disconnected | PeerConnectionState::Failed) => {
                let closed = self.closed(peer, now, Some(*connected_at));
                Some(Step::to(
                    CallState::Ending { peer: peer.clone() },
                    vec![
                        CallAction::CloseMedia,
                        CallAction::SetStatus(PresenceStatus::Online),
                        CallAction::Emit(Event::ConnectionLost(closed)),
                    ],
                ))
            }
            CallInput::MediaState(_) => Some(Step::stay(vec![])),
            CallInput::HangUp | CallInput::Shutdown => Some(Step::to(
                CallState::Idle,
                vec![
                    CallAction::Send {
                        to: peer.clone(),
                        signal: Signal::EndCall,
                    },
                    CallAction::CloseMedia,
                    CallAction::SetStatus(PresenceStatus::Online),
                ],
            )),
            CallInput::SetAudioMuted(muted) => Some(Step::to(
                with_controls(muted, *video_off, *screen_sharing),
                vec![CallAction::SetAudioMuted(muted)],
            )),
            CallInput::SetVideoOff(off) => Some(Step::to(
                with_controls(*audio_muted, off, *screen_sharing),
                vec![CallAction::SetVideoMuted(off)],
            )),
            CallInput::SwitchCamera => Some(Step::stay(vec![CallAction::SwitchCamera])),
            CallInput::StartScreenShare(token) if !screen_sharing => Some(Step::to(
                with_controls(*audio_muted, *video_off, true),
                vec![CallAction::StartScreenCapture(token)],
            )),
            CallInput::StopScreenShare if *screen_sharing => Some(Step::to(
                with_controls(*audio_muted, *video_off, false),
                vec![CallAction::StopScreenCapture],
            )),
            _ => None,
        }
    }
}
