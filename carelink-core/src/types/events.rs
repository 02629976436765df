//! Listener surface exposed to the UI layer.
//!
//! The UI registers an [`EventHandler`] on the client's [`CoreEventBus`] and
//! receives one [`Event`] per call-level occurrence. Every way a call can
//! finish has its own variant so end-of-call messaging can differ.

use super::call::{CallId, CallMedia};
use super::envelope::{Envelope, SignalType};
use super::presence::PresenceStatus;
use super::user::UserId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

#[derive(Default, Clone)]
pub struct CoreEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    /// Returns true if there are any event handlers registered.
    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub from: UserId,
    pub media: CallMedia,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallConnected {
    pub call_id: CallId,
    pub peer: UserId,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteStreamAttached {
    pub call_id: CallId,
    pub peer: UserId,
    pub stream_id: String,
}

/// Common payload of every call-finished event.
#[derive(Debug, Clone, Serialize)]
pub struct CallClosed {
    pub call_id: CallId,
    pub peer: UserId,
    pub closed_at: DateTime<Utc>,
    /// Seconds spent in the connected phase, if the call got that far.
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusChanged {
    pub user: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalSendFailed {
    pub target: UserId,
    pub kind: SignalType,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event {
    /// A decodable envelope arrived in our mailbox (before the state machine
    /// decided whether it applies).
    SignalReceived(Envelope),
    IncomingCall(IncomingCall),
    CallConnected(CallConnected),
    RemoteStreamAttached(RemoteStreamAttached),
    /// The peer hung up an established call.
    CallEnded(CallClosed),
    /// The peer declined our call.
    CallDenied(CallClosed),
    /// The caller gave up before we picked up.
    CallAborted(CallClosed),
    /// A call to us was not picked up in time (by either side's timer).
    CallMissed(CallClosed),
    /// Our outgoing call rang out without an answer, on our timer or the
    /// callee's.
    CallUnanswered(CallClosed),
    /// The media connection failed or dropped mid-call.
    ConnectionLost(CallClosed),
    /// Offer/answer/ICE exchange did not complete in time.
    NegotiationTimedOut(CallClosed),
    StatusChanged(StatusChanged),
    SignalSendFailed(SignalSendFailed),
}

impl Event {
    /// The closing payload, for the events that end a call.
    pub fn closed(&self) -> Option<&CallClosed> {
        match self {
            Self::CallEnded(c)
            | Self::CallDenied(c)
            | Self::CallAborted(c)
            | Self::CallMissed(c)
            | Self::CallUnanswered(c)
            | Self::ConnectionLost(c)
            | Self::NegotiationTimedOut(c) => Some(c),
            _ => None,
        }
    }
}
