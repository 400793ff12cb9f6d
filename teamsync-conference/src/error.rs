//! Error types for the conferencing layer

use std::time::Duration;
use thiserror::Error;

use crate::media::DeviceError;

/// Conference error types.
///
/// Hardware, negotiation and delivery failures are all recoverable: the worst
/// outcome of any of them is the loss of one peer link or one toggle.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Media device error: {0}")]
    Hardware(#[from] DeviceError),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Negotiation made no progress within {0:?}")]
    NegotiationTimeout(Duration),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for conference operations
pub type Result<T> = std::result::Result<T, Error>;
