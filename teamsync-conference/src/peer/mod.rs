//! Peer links: one negotiated media connection per participant pair.
//!
//! A [`PeerConnectionManager`] owns the negotiation state of one link and runs
//! inside its own task behind a [`PeerHandle`]. The [`PeerArena`] holds the
//! local participant's handles and fans outbound track changes out to them.

mod arena;
mod handle;
mod link;
mod manager;
mod rtc;

pub use arena::PeerArena;
pub use handle::PeerHandle;
pub use link::{IceCandidate, InboundSink, LinkFactory, MediaLink, ReplaceOutcome};
pub use manager::{LinkState, PeerConnectionManager, Role};
pub use rtc::{RtcLink, RtcLinkFactory};
