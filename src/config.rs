use std::time::Duration;

/// Tunables for one client session.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Root key under which every user's relay record lives.
    pub relay_root: String,
    /// How long REQUESTING and RINGING wait for the other side to pick up.
    pub ring_timeout: Duration,
    /// How long NEGOTIATING waits for the media connection to come up.
    pub negotiation_timeout: Duration,
    /// Capacity of the orchestrator's command and media-event queues.
    pub command_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_root: carelink_core::relay_path::DEFAULT_ROOT.to_string(),
            ring_timeout: Duration::from_secs(45),
            negotiation_timeout: Duration::from_secs(30),
            command_buffer: 32,
        }
    }
}
