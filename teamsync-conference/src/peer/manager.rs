use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::link::{IceCandidate, MediaLink, ReplaceOutcome};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, RemoteTrack};
use crate::protocol::NegotiationPayload;
use crate::relay::RelayClient;
use crate::types::{PairKey, ParticipantId, TrackKind};

/// Negotiation state of one peer link. Never cycles back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// One side of the link between the local participant and one remote
/// participant.
///
/// Only the initiator ever sends offers. A responder that needs a new
/// sender asks for a fresh offer with a `renegotiate` request, so the two
/// sides never offer at the same time.
pub struct PeerConnectionManager {
    key: PairKey,
    local: ParticipantId,
    remote: ParticipantId,
    link: Box<dyn MediaLink>,
    relay: Arc<dyn RelayClient>,
    state: LinkState,
    role: Option<Role>,
    /// Outbound track per sender slot
    senders: HashMap<TrackKind, Option<LocalTrack>>,
    /// Track changes requested before the link was connected
    staged: HashMap<TrackKind, Option<LocalTrack>>,
    /// Tracks the remote side sends, per kind
    inbound: HashMap<TrackKind, RemoteTrack>,
    inbound_events: Option<mpsc::UnboundedReceiver<RemoteTrack>>,
    pending_candidates: Vec<IceCandidate>,
    /// When the unanswered renegotiation offer went out
    awaiting_answer: Option<Instant>,
    renegotiate_after_answer: bool,
    last_activity: Instant,
}

impl PeerConnectionManager {
    pub fn new(
        local: ParticipantId,
        remote: ParticipantId,
        link: Box<dyn MediaLink>,
        relay: Arc<dyn RelayClient>,
    ) -> Result<Self> {
        let key = PairKey::new(local.clone(), remote.clone())
            .ok_or_else(|| Error::InvalidInput(format!("cannot link {local} to itself")))?;
        Ok(Self {
            key,
            local,
            remote,
            link,
            relay,
            state: LinkState::Idle,
            role: None,
            senders: HashMap::new(),
            staged: HashMap::new(),
            inbound: HashMap::new(),
            inbound_events: None,
            pending_candidates: Vec::new(),
            awaiting_answer: None,
            renegotiate_after_answer: false,
            last_activity: Instant::now(),
        })
    }

    /// Receive the tracks the link reports through its [`InboundSink`]
    ///
    /// [`InboundSink`]: super::link::InboundSink
    #[must_use]
    pub fn with_inbound(mut self, events: mpsc::UnboundedReceiver<RemoteTrack>) -> Self {
        self.inbound_events = Some(events);
        self
    }

    #[must_use]
    pub const fn key(&self) -> &PairKey {
        &self.key
    }

    #[must_use]
    pub const fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub const fn role(&self) -> Option<Role> {
        self.role
    }

    /// Track currently sent in the `kind` slot
    #[must_use]
    pub fn outbound(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.senders.get(&kind).and_then(Option::as_ref)
    }

    /// Track currently received in the `kind` slot
    #[must_use]
    pub fn inbound(&self, kind: TrackKind) -> Option<&RemoteTrack> {
        self.inbound.get(&kind)
    }

    #[must_use]
    pub fn inbound_tracks(&self) -> Vec<RemoteTrack> {
        let mut tracks: Vec<_> = self.inbound.values().cloned().collect();
        tracks.sort_by_key(|t| t.kind() == TrackKind::Video);
        tracks
    }

    /// Record a track the remote side started sending. A newer track of the
    /// same kind replaces the old one. Returns false once closed.
    pub fn add_inbound(&mut self, track: RemoteTrack) -> bool {
        if self.state == LinkState::Closed {
            return false;
        }
        debug!(link = %self.key, kind = %track.kind(), track_id = track.id(), "Inbound track");
        self.inbound.insert(track.kind(), track);
        self.touch();
        true
    }

    pub(crate) fn take_inbound_events(&mut self) -> Option<mpsc::UnboundedReceiver<RemoteTrack>> {
        self.inbound_events.take()
    }

    /// When the current offer/answer exchange counts as stalled: the first
    /// negotiation, or an unanswered renegotiation offer
    pub(crate) fn negotiation_deadline(&self, timeout: Duration) -> Option<Instant> {
        match (self.state, self.awaiting_answer) {
            (LinkState::Negotiating, _) => Some(self.last_activity + timeout),
            (LinkState::Connected, Some(offered_at)) => Some(offered_at + timeout),
            _ => None,
        }
    }

    /// Start negotiating as the offering side. Valid only from `Idle`.
    pub async fn initiate(&mut self) -> Result<()> {
        if self.state != LinkState::Idle {
            return Err(Error::InvalidState(format!(
                "initiate on {} link to {}",
                self.state, self.remote
            )));
        }
        self.role = Some(Role::Initiator);
        self.set_state(LinkState::Negotiating);

        self.attach_staged().await?;
        let sdp = self.link.create_offer().await?;
        self.send(NegotiationPayload::Offer { sdp }).await
    }

    /// Advance negotiation with a payload relayed from the remote side
    pub async fn accept_remote_signal(&mut self, payload: NegotiationPayload) -> Result<()> {
        match (self.state, payload) {
            (LinkState::Closed, payload) => Err(Error::InvalidState(format!(
                "{} on closed link to {}",
                payload.kind(),
                self.remote
            ))),

            (LinkState::Idle, NegotiationPayload::Offer { sdp }) => {
                self.role = Some(Role::Responder);
                self.set_state(LinkState::Negotiating);
                self.attach_staged().await?;
                let answer = self.link.accept_offer(sdp).await?;
                self.flush_candidates().await?;
                self.send(NegotiationPayload::Answer { sdp: answer }).await?;
                self.set_state(LinkState::Connected);
                Ok(())
            }
            (LinkState::Connected, NegotiationPayload::Offer { sdp }) => {
                if self.awaiting_answer.is_some() {
                    return Err(Error::InvalidState(format!(
                        "offer from {} while our own offer is unanswered",
                        self.remote
                    )));
                }
                let answer = self.link.accept_offer(sdp).await?;
                self.touch();
                self.send(NegotiationPayload::Answer { sdp: answer }).await
            }
            (LinkState::Negotiating, NegotiationPayload::Offer { .. }) => Err(Error::InvalidState(
                format!("offer from {} while already negotiating", self.remote),
            )),

            (LinkState::Negotiating, NegotiationPayload::Answer { sdp })
                if self.role == Some(Role::Initiator) =>
            {
                self.link.accept_answer(sdp).await?;
                self.flush_candidates().await?;
                self.set_state(LinkState::Connected);
                self.apply_staged().await?;
                if std::mem::take(&mut self.renegotiate_after_answer) {
                    self.renegotiate().await?;
                }
                Ok(())
            }
            (LinkState::Connected, NegotiationPayload::Answer { sdp })
                if self.awaiting_answer.is_some() =>
            {
                self.link.accept_answer(sdp).await?;
                self.awaiting_answer = None;
                self.touch();
                if std::mem::take(&mut self.renegotiate_after_answer) {
                    self.renegotiate().await?;
                }
                Ok(())
            }
            (state, NegotiationPayload::Answer { .. }) => Err(Error::InvalidState(format!(
                "unexpected answer from {} in {state}",
                self.remote
            ))),

            (LinkState::Connected, NegotiationPayload::Renegotiate)
                if self.role == Some(Role::Initiator) =>
            {
                self.renegotiate().await
            }
            (LinkState::Negotiating, NegotiationPayload::Renegotiate)
                if self.role == Some(Role::Initiator) =>
            {
                self.renegotiate_after_answer = true;
                Ok(())
            }
            (state, NegotiationPayload::Renegotiate) => Err(Error::InvalidState(format!(
                "renegotiate request from {} in {state}",
                self.remote
            ))),

            (
                state,
                NegotiationPayload::Candidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
            ) => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                if state == LinkState::Connected {
                    self.link.add_ice_candidate(candidate).await
                } else {
                    self.pending_candidates.push(candidate);
                    Ok(())
                }
            }
        }
    }

    /// Swap the outbound track of `kind` without renegotiating. Falls back to
    /// attach plus a fresh offer when the link has no sender of that kind.
    /// Requests made before the link is connected are staged.
    pub async fn replace_outbound_track(
        &mut self,
        kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<()> {
        match self.state {
            LinkState::Closed => {
                return Err(Error::InvalidState(format!("replace on closed link to {}", self.remote)));
            }
            LinkState::Idle | LinkState::Negotiating => {
                self.staged.insert(kind, track);
                return Ok(());
            }
            LinkState::Connected => {}
        }

        if self.outbound(kind) == track.as_ref() {
            return Ok(());
        }

        match self.link.replace_track(kind, track.clone()).await? {
            ReplaceOutcome::Replaced => {
                debug!(link = %self.key, %kind, "Outbound track replaced in place");
                self.senders.insert(kind, track);
            }
            ReplaceOutcome::NoSender => match track {
                Some(track) => {
                    self.link.attach_track(track.clone()).await?;
                    self.senders.insert(kind, Some(track));
                    self.renegotiate().await?;
                }
                None => {
                    self.senders.remove(&kind);
                }
            },
        }
        self.touch();
        Ok(())
    }

    /// Release every track reference and close the link. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        self.state = LinkState::Closed;
        self.senders.clear();
        self.staged.clear();
        self.inbound.clear();
        self.inbound_events = None;
        self.pending_candidates.clear();
        self.awaiting_answer = None;
        if let Err(e) = self.link.close().await {
            debug!(link = %self.key, error = %e, "Error while closing media link");
        }
        info!(local = %self.local, remote = %self.remote, "Peer link closed");
        Ok(())
    }

    async fn renegotiate(&mut self) -> Result<()> {
        if self.role != Some(Role::Initiator) {
            debug!(link = %self.key, "Asking the initiator for a fresh offer");
            return self.send(NegotiationPayload::Renegotiate).await;
        }
        if self.awaiting_answer.is_some() {
            self.renegotiate_after_answer = true;
            return Ok(());
        }
        let sdp = self.link.create_offer().await?;
        self.awaiting_answer = Some(Instant::now());
        debug!(link = %self.key, "Renegotiating");
        self.send(NegotiationPayload::Offer { sdp }).await
    }

    async fn attach_staged(&mut self) -> Result<()> {
        for (kind, track) in std::mem::take(&mut self.staged) {
            if let Some(track) = track {
                self.link.attach_track(track.clone()).await?;
                self.senders.insert(kind, Some(track));
            }
        }
        Ok(())
    }

    async fn apply_staged(&mut self) -> Result<()> {
        for (kind, track) in std::mem::take(&mut self.staged) {
            self.replace_outbound_track(kind, track).await?;
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<()> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.link.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn send(&self, payload: NegotiationPayload) -> Result<()> {
        let kind = payload.kind();
        let report = self.relay.signal(&self.remote, payload).await?;
        if !report.is_complete() {
            return Err(Error::Negotiation(format!(
                "{} unreachable for {kind}",
                self.remote
            )));
        }
        Ok(())
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!(link = %self.key, from = %self.state, to = %state, "Link state changed");
            self.state = state;
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
