//! Platform-agnostic signaling types shared by the carelink client.
//!
//! Nothing in here touches an async runtime: the wire envelope, the presence
//! flags, the relay path schema and the listener surface the UI binds to.

pub mod relay_path;
pub mod types;

pub use relay_path::RelayPaths;
pub use types::envelope::{Envelope, EnvelopeError, Signal, SignalType};
pub use types::events::{CoreEventBus, Event, EventHandler};
pub use types::call::{CallDirection, CallId, CallMedia, CallPhase};
pub use types::media::{IceCandidate, SdpType, SessionDescription};
pub use types::presence::PresenceStatus;
pub use types::user::{InvalidUserId, UserId};
