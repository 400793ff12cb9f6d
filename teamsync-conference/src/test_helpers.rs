//! Shared fakes for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::media::{LocalTrack, RemoteTrack, TrackFanout};
use crate::peer::{IceCandidate, InboundSink, LinkFactory, MediaLink, ReplaceOutcome};
use crate::protocol::{BreakoutCommand, MembershipSnapshot, NegotiationPayload, ScopeEvent};
use crate::relay::{BreakoutOutcome, DeliveryReport, RelayClient};
use crate::room::ParticipantInfo;
use crate::types::{PairKey, ParticipantId, RoomId, TrackKind};

/// Fanout that records every change and reports one link per call
#[derive(Default)]
pub struct RecordingFanout {
    calls: Mutex<Vec<(TrackKind, Option<LocalTrack>)>>,
}

impl RecordingFanout {
    pub fn calls(&self) -> Vec<(TrackKind, Option<LocalTrack>)> {
        self.calls.lock().clone()
    }
}

impl TrackFanout for RecordingFanout {
    fn replace_outbound(&self, kind: TrackKind, track: Option<LocalTrack>) -> usize {
        self.calls.lock().push((kind, track));
        1
    }
}

/// Relay client that records outgoing signals instead of delivering them
pub struct RecordingRelay {
    id: ParticipantId,
    signals: Mutex<Vec<(ParticipantId, NegotiationPayload)>>,
    taken: Mutex<usize>,
    published: Mutex<Vec<ScopeEvent>>,
    unreachable: AtomicBool,
}

impl Default for RecordingRelay {
    fn default() -> Self {
        Self {
            id: ParticipantId::from("local"),
            signals: Mutex::new(Vec::new()),
            taken: Mutex::new(0),
            published: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
        }
    }
}

impl RecordingRelay {
    /// Report every target as unreachable from now on
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn signal_kinds(&self) -> Vec<&'static str> {
        self.signals.lock().iter().map(|(_, p)| p.kind()).collect()
    }

    /// Signals sent since the previous call, in send order
    pub fn take_signals(&self) -> Vec<NegotiationPayload> {
        let signals = self.signals.lock();
        let mut taken = self.taken.lock();
        let fresh = signals[*taken..].iter().map(|(_, p)| p.clone()).collect();
        *taken = signals.len();
        fresh
    }

    pub fn published(&self) -> Vec<ScopeEvent> {
        self.published.lock().clone()
    }

    fn report(&self, target: &ParticipantId) -> DeliveryReport {
        if self.unreachable.load(Ordering::SeqCst) {
            DeliveryReport {
                delivered: 0,
                unreachable: vec![target.clone()],
            }
        } else {
            DeliveryReport {
                delivered: 1,
                unreachable: Vec::new(),
            }
        }
    }
}

#[async_trait]
impl RelayClient for RecordingRelay {
    fn participant_id(&self) -> &ParticipantId {
        &self.id
    }

    async fn join(&self, room_id: RoomId, _info: ParticipantInfo) -> Result<MembershipSnapshot> {
        Err(Error::Relay(format!("recording relay cannot join {room_id}")))
    }

    async fn leave(&self) -> Result<()> {
        Ok(())
    }

    async fn signal(
        &self,
        target: &ParticipantId,
        payload: NegotiationPayload,
    ) -> Result<DeliveryReport> {
        self.signals.lock().push((target.clone(), payload));
        Ok(self.report(target))
    }

    async fn publish(&self, event: ScopeEvent) -> Result<DeliveryReport> {
        self.published.lock().push(event);
        Ok(DeliveryReport::default())
    }

    async fn breakout(&self, command: BreakoutCommand) -> Result<BreakoutOutcome> {
        Err(Error::Relay(format!(
            "recording relay cannot run {}",
            command.name()
        )))
    }
}

/// Link that tracks which senders exist and refuses a remote offer while
/// its own offer is outstanding, the way a real peer connection does
#[derive(Default)]
pub struct LoopbackLink {
    senders: Mutex<HashSet<TrackKind>>,
    local_offer: AtomicBool,
}

#[async_trait]
impl MediaLink for LoopbackLink {
    async fn create_offer(&self) -> Result<String> {
        self.local_offer.store(true, Ordering::SeqCst);
        Ok("v=0 offer".into())
    }

    async fn accept_offer(&self, _sdp: String) -> Result<String> {
        if self.local_offer.load(Ordering::SeqCst) {
            return Err(Error::Negotiation(
                "remote offer while a local offer is pending".into(),
            ));
        }
        Ok("v=0 answer".into())
    }

    async fn accept_answer(&self, _sdp: String) -> Result<()> {
        if !self.local_offer.swap(false, Ordering::SeqCst) {
            return Err(Error::Negotiation("answer without a local offer".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }

    async fn attach_track(&self, track: LocalTrack) -> Result<()> {
        self.senders.lock().insert(track.kind());
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, _track: Option<LocalTrack>) -> Result<ReplaceOutcome> {
        if self.senders.lock().contains(&kind) {
            Ok(ReplaceOutcome::Replaced)
        } else {
            Ok(ReplaceOutcome::NoSender)
        }
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.local_offer.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for [`LoopbackLink`]s that counts what it built
#[derive(Default)]
pub struct LoopbackFactory {
    created: Mutex<Vec<PairKey>>,
    sinks: Mutex<Vec<(PairKey, InboundSink)>>,
}

impl LoopbackFactory {
    pub fn created(&self) -> Vec<PairKey> {
        self.created.lock().clone()
    }

    /// Deliver `track` as if the remote side of the newest `key` link
    /// started sending it
    pub fn announce(&self, key: &PairKey, track: RemoteTrack) -> bool {
        self.sinks
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .is_some_and(|(_, sink)| sink.send(track).is_ok())
    }
}

#[async_trait]
impl LinkFactory for LoopbackFactory {
    async fn create(&self, key: &PairKey, inbound: InboundSink) -> Result<Box<dyn MediaLink>> {
        self.created.lock().push(key.clone());
        self.sinks.lock().push((key.clone(), inbound));
        Ok(Box::new(LoopbackLink::default()))
    }
}
