use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{PairKey, TrackKind};

/// ICE candidate as carried in a `candidate` negotiation payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Result of swapping the track behind an outbound sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Swapped in place, no renegotiation needed
    Replaced,
    /// No sender of that kind exists; the track must be attached and the
    /// link renegotiated
    NoSender,
}

/// Negotiated media transport between two participants.
///
/// SDP crosses this seam as plain strings; the caller relays them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaLink: Send + Sync {
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and produce the answer
    async fn accept_offer(&self, sdp: String) -> Result<String>;

    async fn accept_answer(&self, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Add a new outbound sender for `track`. Takes effect on the next offer.
    async fn attach_track(&self, track: LocalTrack) -> Result<()>;

    /// Swap the track behind the existing sender of `kind`; `None` mutes it
    async fn replace_track(&self, kind: TrackKind, track: Option<LocalTrack>) -> Result<ReplaceOutcome>;

    async fn close(&self) -> Result<()>;
}

/// Where a link reports tracks the remote side starts sending
pub type InboundSink = mpsc::UnboundedSender<RemoteTrack>;

/// Creates one [`MediaLink`] per participant pair
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(&self, key: &PairKey, inbound: InboundSink) -> Result<Box<dyn MediaLink>>;
}
