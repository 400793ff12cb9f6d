//! End-to-end meeting scenarios: several session participants over one
//! in-process relay, with loopback media links.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use teamsync_conference::media::{LocalTrack, SampleDevices, VideoSource};
use teamsync_conference::peer::{
    IceCandidate, InboundSink, LinkFactory, LinkState, MediaLink, PeerConnectionManager,
    ReplaceOutcome,
};
use teamsync_conference::protocol::{Assignment, BreakoutCommand, BreakoutState, SignalMessage};
use teamsync_conference::room::ParticipantInfo;
use teamsync_conference::types::{MediaFlags, PairKey, TrackKind};
use teamsync_conference::{
    ConferenceConfig, Error, LocalRelayClient, ParticipantId, RelayClient, RoomId, Scope,
    SessionParticipant, SignalingRelay,
};

/// Refuses a remote offer while its own offer is pending, like a real peer
/// connection without rollback
#[derive(Default)]
struct LoopbackLink {
    senders: Mutex<HashSet<TrackKind>>,
    local_offer: AtomicBool,
}

#[async_trait]
impl MediaLink for LoopbackLink {
    async fn create_offer(&self) -> teamsync_conference::Result<String> {
        self.local_offer.store(true, Ordering::SeqCst);
        Ok("v=0 offer".into())
    }

    async fn accept_offer(&self, _sdp: String) -> teamsync_conference::Result<String> {
        if self.local_offer.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("offer collision".into()));
        }
        Ok("v=0 answer".into())
    }

    async fn accept_answer(&self, _sdp: String) -> teamsync_conference::Result<()> {
        if !self.local_offer.swap(false, Ordering::SeqCst) {
            return Err(Error::Negotiation("answer without offer".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> teamsync_conference::Result<()> {
        Ok(())
    }

    async fn attach_track(&self, track: LocalTrack) -> teamsync_conference::Result<()> {
        self.senders.lock().insert(track.kind());
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        _track: Option<LocalTrack>,
    ) -> teamsync_conference::Result<ReplaceOutcome> {
        Ok(if self.senders.lock().contains(&kind) {
            ReplaceOutcome::Replaced
        } else {
            ReplaceOutcome::NoSender
        })
    }

    async fn close(&self) -> teamsync_conference::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackFactory {
    created: Mutex<usize>,
}

#[async_trait]
impl LinkFactory for LoopbackFactory {
    async fn create(
        &self,
        _key: &PairKey,
        _inbound: InboundSink,
    ) -> teamsync_conference::Result<Box<dyn MediaLink>> {
        *self.created.lock() += 1;
        Ok(Box::new(LoopbackLink::default()))
    }
}

struct Member {
    id: ParticipantId,
    session: SessionParticipant,
    inbox: UnboundedReceiver<SignalMessage>,
    factory: Arc<LoopbackFactory>,
}

impl Member {
    fn new(relay: &Arc<SignalingRelay>, id: &str, is_host: bool) -> Self {
        Self::build(relay, ParticipantInfo::new(id, id.to_uppercase()).with_host(is_host))
    }

    fn with_flags(relay: &Arc<SignalingRelay>, id: &str, flags: MediaFlags) -> Self {
        Self::build(relay, ParticipantInfo::new(id, id.to_uppercase()).with_flags(flags))
    }

    fn build(relay: &Arc<SignalingRelay>, info: ParticipantInfo) -> Self {
        let id = info.id.clone();
        let (client, inbox) = LocalRelayClient::connect(relay.clone(), id.clone());
        let factory = Arc::new(LoopbackFactory::default());
        let session = SessionParticipant::new(
            info,
            Arc::new(client),
            factory.clone(),
            Arc::new(SampleDevices::new(id.as_str())),
            ConferenceConfig::default(),
        );
        Self {
            id,
            session,
            inbox,
            factory,
        }
    }

    async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inbox.try_recv() {
            self.session.handle_signal(message).await;
            handled += 1;
        }
        handled
    }

    fn state_with(&self, other: &Member) -> Option<LinkState> {
        self.session.link_state(&other.id)
    }
}

async fn settle(members: &mut [&mut Member]) {
    let mut quiet = 0;
    while quiet < 5 {
        let mut handled = 0;
        for member in members.iter_mut() {
            handled += member.pump().await;
        }
        quiet = if handled == 0 { quiet + 1 } else { 0 };
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Every pair sharing a scope has exactly one connected link, and nobody
/// holds a link across scopes
fn assert_full_mesh(relay: &SignalingRelay, members: &[&Member]) {
    for member in members {
        let scope = relay.scope_of(&member.id).unwrap();
        let peers: Vec<_> = members
            .iter()
            .filter(|m| m.id != member.id)
            .filter(|m| relay.scope_of(&m.id).as_ref() == Some(&scope))
            .collect();
        assert_eq!(
            member.session.links().len(),
            peers.len(),
            "{} link count",
            member.id
        );
        for peer in peers {
            assert_eq!(
                member.state_with(peer),
                Some(LinkState::Connected),
                "{} -> {}",
                member.id,
                peer.id
            );
        }
    }
}

async fn meeting(relay: &Arc<SignalingRelay>) -> (Member, Member, Member) {
    let mut a = Member::new(relay, "a", true);
    let mut b = Member::new(relay, "b", false);
    let mut c = Member::new(relay, "c", false);
    for member in [&mut a, &mut b, &mut c] {
        member.session.join(RoomId::from("m")).await.unwrap();
    }
    settle(&mut [&mut a, &mut b, &mut c]).await;
    (a, b, c)
}

#[tokio::test]
async fn test_full_mesh_after_joins_and_leaves() {
    let relay = Arc::new(SignalingRelay::default());
    let (mut a, mut b, mut c) = meeting(&relay).await;
    let mut d = Member::new(&relay, "d", false);
    d.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;
    assert_full_mesh(&relay, &[&a, &b, &c, &d]);

    b.session.leave().await;
    settle(&mut [&mut a, &mut c, &mut d]).await;
    assert_full_mesh(&relay, &[&a, &c, &d]);
    assert!(b.session.links().is_empty());
}

#[tokio::test]
async fn test_team_a_breakout_scenario() {
    let relay = Arc::new(SignalingRelay::default());
    let (mut a, mut b, mut c) = meeting(&relay).await;

    let team_a = a
        .session
        .breakout(BreakoutCommand::CreateRoom {
            name: "Team A".into(),
        })
        .await
        .unwrap()
        .created
        .unwrap();
    let outcome = a
        .session
        .breakout(BreakoutCommand::Assign {
            assignments: vec![Assignment::new("b", team_a.as_str())],
        })
        .await
        .unwrap();
    assert_eq!(outcome.moved, 1);
    settle(&mut [&mut a, &mut b, &mut c]).await;

    let snapshot = relay.room_snapshot(&RoomId::from("m")).unwrap();
    assert_eq!(snapshot.breakout_state, BreakoutState::RoomsActive);
    assert_eq!(snapshot.breakout_rooms[0].participants, vec![b.id.clone()]);
    assert_eq!(relay.scope_of(&a.id), Some(Scope::Main));
    assert_eq!(relay.scope_of(&c.id), Some(Scope::Main));

    assert_eq!(b.session.scope(), &Scope::Breakout(team_a.clone()));
    assert!(b.session.roster().is_empty());
    assert_eq!(a.session.roster().len(), 1);
    assert_eq!(c.session.breakout_state(), BreakoutState::RoomsActive);
    assert_full_mesh(&relay, &[&a, &b, &c]);

    // A non-host cannot close the room
    assert!(c
        .session
        .breakout(BreakoutCommand::CloseRoom {
            breakout_room_id: team_a.clone(),
        })
        .await
        .is_err());

    a.session
        .breakout(BreakoutCommand::CloseRoom {
            breakout_room_id: team_a,
        })
        .await
        .unwrap();
    // Closure is atomic at the relay before anyone processes a message
    assert_eq!(relay.scope_of(&b.id), Some(Scope::Main));
    assert!(relay
        .room_snapshot(&RoomId::from("m"))
        .unwrap()
        .breakout_rooms
        .is_empty());

    settle(&mut [&mut a, &mut b, &mut c]).await;
    assert_eq!(b.session.scope(), &Scope::Main);
    assert_eq!(a.session.breakout_state(), BreakoutState::MainOnly);
    assert_full_mesh(&relay, &[&a, &b, &c]);
}

#[tokio::test]
async fn test_breakout_room_mesh_through_return_and_close_all() {
    let relay = Arc::new(SignalingRelay::default());
    let (mut a, mut b, mut c) = meeting(&relay).await;
    let mut d = Member::new(&relay, "d", false);
    d.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;

    let team = a
        .session
        .breakout(BreakoutCommand::CreateRoom { name: "T".into() })
        .await
        .unwrap()
        .created
        .unwrap();
    let outcome = a
        .session
        .breakout(BreakoutCommand::Assign {
            assignments: vec![
                Assignment::new("b", team.as_str()),
                Assignment::new("c", team.as_str()),
            ],
        })
        .await
        .unwrap();
    assert_eq!(outcome.moved, 2);
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;

    assert_eq!(relay.scope_of(&b.id), Some(Scope::Breakout(team.clone())));
    assert_eq!(relay.scope_of(&c.id), Some(Scope::Breakout(team.clone())));
    assert_eq!(b.session.links().len(), 1);
    assert_eq!(b.state_with(&c), Some(LinkState::Connected));
    assert_eq!(a.state_with(&d), Some(LinkState::Connected));
    assert_full_mesh(&relay, &[&a, &b, &c, &d]);

    c.session.breakout(BreakoutCommand::ReturnToMain).await.unwrap();
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;
    assert_eq!(c.session.scope(), &Scope::Main);
    assert!(b.session.links().is_empty());
    assert_eq!(c.session.links().len(), 2);
    assert_full_mesh(&relay, &[&a, &b, &c, &d]);

    a.session.breakout(BreakoutCommand::CloseAll).await.unwrap();
    settle(&mut [&mut a, &mut b, &mut c, &mut d]).await;
    for member in [&a, &b, &c, &d] {
        assert_eq!(member.session.scope(), &Scope::Main);
        assert_eq!(member.session.breakout_state(), BreakoutState::MainOnly);
    }
    assert_eq!(b.session.links().len(), 3);
    assert_full_mesh(&relay, &[&a, &b, &c, &d]);
}

#[tokio::test]
async fn test_both_sides_enabling_camera_at_once() {
    let relay = Arc::new(SignalingRelay::default());
    let camera_off = MediaFlags {
        mic_on: true,
        camera_on: false,
        is_screen_sharing: false,
    };
    let mut b = Member::with_flags(&relay, "b", camera_off);
    let mut c = Member::with_flags(&relay, "c", camera_off);
    b.session.join(RoomId::from("m")).await.unwrap();
    c.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut b, &mut c]).await;
    assert_eq!(b.state_with(&c), Some(LinkState::Connected));

    // Neither side has a video sender yet and neither has seen the other's
    // toggle
    b.session.set_camera(true).await.unwrap();
    c.session.set_camera(true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    settle(&mut [&mut b, &mut c]).await;

    assert_eq!(b.state_with(&c), Some(LinkState::Connected));
    assert_eq!(c.state_with(&b), Some(LinkState::Connected));
    assert_eq!(*b.factory.created.lock(), 1);
    assert_eq!(*c.factory.created.lock(), 1);
    assert!(b.session.roster()[0].flags.camera_on);
    assert!(c.session.roster()[0].flags.camera_on);
}

#[tokio::test]
async fn test_camera_toggles_keep_single_link() {
    let relay = Arc::new(SignalingRelay::default());
    let mut b = Member::new(&relay, "b", false);
    let mut c = Member::new(&relay, "c", false);
    b.session.join(RoomId::from("m")).await.unwrap();
    c.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut b, &mut c]).await;

    for _ in 0..2 {
        b.session.set_camera(false).await.unwrap();
        b.session.set_camera(true).await.unwrap();
    }
    settle(&mut [&mut b, &mut c]).await;

    assert!(b.session.media_state().camera_on);
    assert_eq!(b.session.links().len(), 1);
    assert_eq!(b.state_with(&c), Some(LinkState::Connected));
    assert_eq!(c.state_with(&b), Some(LinkState::Connected));
    assert_eq!(*b.factory.created.lock(), 1);
    assert!(c.session.roster()[0].flags.camera_on);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_peer_times_out_alone() {
    let relay = Arc::new(SignalingRelay::default());
    let mut a = Member::new(&relay, "a", true);
    let mut c = Member::new(&relay, "c", false);
    a.session.join(RoomId::from("m")).await.unwrap();
    c.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut a, &mut c]).await;

    // b offers to both; c never processes its inbox
    let mut b = Member::new(&relay, "b", false);
    b.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.state_with(&a), Some(LinkState::Connected));

    let stalled = b.session.links().by_remote(&c.id).unwrap();
    tokio::time::timeout(Duration::from_secs(11), stalled.closed())
        .await
        .expect("negotiation should time out");

    assert_eq!(b.state_with(&c), Some(LinkState::Closed));
    assert_eq!(b.state_with(&a), Some(LinkState::Connected));
    assert_eq!(a.state_with(&c), Some(LinkState::Connected));
}

#[tokio::test]
async fn test_disconnect_mid_negotiation() {
    let relay = Arc::new(SignalingRelay::default());
    let mut a = Member::new(&relay, "a", true);
    let mut c = Member::new(&relay, "c", false);
    a.session.join(RoomId::from("m")).await.unwrap();
    c.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut a, &mut c]).await;

    let mut b = Member::new(&relay, "b", false);
    b.session.join(RoomId::from("m")).await.unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.state_with(&c), Some(LinkState::Negotiating));

    // Transport drop: the relay notices when c's client goes away
    drop(c);
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(relay.participant_count(), 2);
    let c_id = ParticipantId::from("c");
    assert!(b.session.link_state(&c_id).is_none());
    assert!(a.session.link_state(&c_id).is_none());
    assert_full_mesh(&relay, &[&a, &b]);
}

#[tokio::test]
async fn test_screen_share_replaces_camera_as_video_source() {
    let relay = Arc::new(SignalingRelay::default());
    let (mut a, mut b, mut c) = meeting(&relay).await;

    a.session.start_screen_share().await.unwrap();
    let state = a.session.media_state();
    assert_eq!(state.video_source, Some(VideoSource::Screen));
    assert!(state.camera_on);

    settle(&mut [&mut a, &mut b, &mut c]).await;
    assert!(b
        .session
        .roster()
        .iter()
        .any(|e| e.participant_id == a.id && e.flags.is_screen_sharing));

    a.session.stop_screen_share().await.unwrap();
    assert_eq!(a.session.media_state().video_source, Some(VideoSource::Camera));
    settle(&mut [&mut a, &mut b, &mut c]).await;
    assert_full_mesh(&relay, &[&a, &b, &c]);
}

#[tokio::test]
async fn test_manager_close_is_idempotent() {
    let relay = Arc::new(SignalingRelay::default());
    let (client, _inbox) = LocalRelayClient::connect(relay, ParticipantId::from("a"));
    let client: Arc<dyn RelayClient> = Arc::new(client);
    let mut manager = PeerConnectionManager::new(
        ParticipantId::from("a"),
        ParticipantId::from("b"),
        Box::new(LoopbackLink::default()),
        client,
    )
    .unwrap();

    manager.close().await.unwrap();
    manager.close().await.unwrap();
    assert_eq!(manager.state(), LinkState::Closed);
    assert!(manager.outbound(TrackKind::Audio).is_none());
}
