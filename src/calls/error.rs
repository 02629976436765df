//! Call-related error types.

use crate::channel::ChannelError;
use crate::media::MediaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("signal channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("media transport error: {0}")]
    Media(#[from] MediaError),

    #[error("cannot call yourself")]
    SelfCall,

    #[error("call orchestrator is not running")]
    Closed,
}
