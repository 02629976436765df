//! Call signaling for the carelink companion app.
//!
//! Two clients that cannot reach each other directly coordinate a
//! peer-to-peer call through single-slot mailboxes in a realtime relay.

pub use carelink_core;
pub use carelink_core::{
    CallDirection, CallId, CallMedia, CallPhase, CoreEventBus, Envelope, Event, EventHandler,
    PresenceStatus, Signal, SignalType, UserId,
};

pub mod calls;
pub mod channel;
pub mod client;
pub mod config;
pub mod media;
pub mod relay;
#[cfg(test)]
pub(crate) mod test_utils;

pub use client::{Client, ClientError};
pub use config::ClientConfig;
