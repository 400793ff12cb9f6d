//! Conferencing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relay limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum participants per room (0 = unlimited)
    pub max_participants_per_room: usize,
    /// Maximum breakout rooms per room (0 = unlimited)
    pub max_breakout_rooms: usize,
    /// Maximum length of a display name or breakout room name, in characters
    pub max_name_len: usize,
    /// Maximum chat message length, in characters
    pub max_chat_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_participants_per_room: 50,
            max_breakout_rooms: 20,
            max_name_len: 64,
            max_chat_len: 4096,
        }
    }
}

/// Per-participant session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    /// Negotiation deadline in milliseconds; a link making no progress is closed
    pub negotiation_timeout_ms: u64,
    /// Active-speaker level threshold on the 0-255 byte-level scale
    pub speaker_threshold: f32,
    /// Active-speaker sampling interval in milliseconds
    pub speaker_sample_interval_ms: u64,
    /// STUN servers handed to every peer connection
    pub stun_servers: Vec<String>,
    /// Capacity of the UI event broadcast channel
    pub event_buffer: usize,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 10_000,
            speaker_threshold: 10.0,
            speaker_sample_interval_ms: 100,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            event_buffer: 256,
        }
    }
}

impl ConferenceConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    #[must_use]
    pub const fn speaker_sample_interval(&self) -> Duration {
        Duration::from_millis(self.speaker_sample_interval_ms)
    }
}
