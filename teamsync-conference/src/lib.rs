pub mod breakout;
pub mod config;
pub mod error;
pub mod media;
pub mod participant;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::{ConferenceConfig, RelayConfig};
pub use error::{Error, Result};
pub use participant::{Intent, SessionEvent, SessionParticipant};
pub use relay::{LocalRelayClient, RelayClient, SignalingRelay};
pub use types::{BreakoutRoomId, ParticipantId, RoomId, Scope};
