//! Error types for stomp

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad format: {0}")]
    BadFormat(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("internal state: {0}")]
    InternalState(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
