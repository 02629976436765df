//! Call signaling over the relay.
//!
//! # Architecture
//!
//! - [`CallSession`] & [`CallState`]: the pure state machine; `apply` maps
//!   (state, input) to the next state plus an ordered list of [`CallAction`]s
//! - [`CallOrchestrator`]: the actor that owns the session, feeds it
//!   envelopes, media events, timers and UI commands, and performs the actions
//! - [`CallHandle`]: the UI's cloneable handle to a running orchestrator
//!
//! # Protocol overview
//!
//! The caller sends `StartVideoCall`/`StartAudioCall`. The callee, on
//! accept, creates the SDP offer; the caller answers it. Candidates trickle in
//! both directions until the media engine reports CONNECTED. Either side ends
//! the session with `EndCall`, `DenyCall`, `AbortCall` or `MissCall`.

mod error;
mod orchestrator;
mod state;


pub use error::CallError;
pub use orchestrator::{CallHandle, CallOrchestrator};
pub use state::{
    CallAction, CallInput, CallSession, CallSnapshot, CallState, InvalidTransition, TimeoutKind,
};
