//! The local participant's view of a meeting.
//!
//! A [`SessionParticipant`] is driven from a single task: relay messages,
//! UI intents, speaker sampling and screen-capture end are all handled in
//! [`SessionParticipant::run`]. It keeps one peer link per remote member of
//! its current scope, rebuilding the mesh whenever that scope changes.

mod speaker;

pub use speaker::ActiveSpeakerDetector;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ConferenceConfig;
use crate::error::{Error, Result};
use crate::media::{DeviceError, MediaDevices, MediaState, MediaTrackController, RemoteTrack};
use crate::peer::{LinkFactory, LinkState, PeerArena, PeerConnectionManager, PeerHandle};
use crate::protocol::{
    BreakoutCommand, BreakoutRoomInfo, BreakoutState, MembershipSnapshot, NegotiationPayload,
    RosterEntry, ScopeEvent, SignalMessage,
};
use crate::relay::{BreakoutOutcome, RelayClient};
use crate::room::ParticipantInfo;
use crate::types::{MediaFlags, PairKey, ParticipantId, RoomId, Scope, TrackKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// State changes surfaced to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined {
        room_id: RoomId,
        scope: Scope,
    },
    ParticipantJoined {
        participant_id: ParticipantId,
        display_name: String,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    MediaChanged {
        participant_id: ParticipantId,
        flags: MediaFlags,
    },
    LinkStateChanged {
        participant_id: ParticipantId,
        state: LinkState,
    },
    /// A remote member started sending a track to us
    RemoteTrack {
        participant_id: ParticipantId,
        track: RemoteTrack,
    },
    /// Non-fatal hardware problem; the feature fell back to off
    HardwareNotice(DeviceError),
    ScopeChanged {
        scope: Scope,
    },
    BreakoutRoomsUpdated {
        state: BreakoutState,
        rooms: Vec<BreakoutRoomInfo>,
    },
    BreakoutBroadcast {
        sender_id: ParticipantId,
        message: String,
    },
    Chat(ChatEntry),
    ActiveSpeaker {
        participant_id: ParticipantId,
        speaking: bool,
    },
    RelayError {
        message: String,
    },
    Left,
}

/// Local user actions fed into [`SessionParticipant::run`]
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SetMic(bool),
    SetCamera(bool),
    StartScreenShare,
    StopScreenShare,
    Chat(String),
    Breakout(BreakoutCommand),
    /// Latest audio level of a participant, local or remote
    AudioLevel {
        participant_id: ParticipantId,
        level: f32,
    },
    Leave,
}

pub struct SessionParticipant {
    info: ParticipantInfo,
    relay: Arc<dyn RelayClient>,
    factory: Arc<dyn LinkFactory>,
    config: ConferenceConfig,
    room_id: Option<RoomId>,
    scope: Scope,
    host_id: Option<ParticipantId>,
    roster: HashMap<ParticipantId, RosterEntry>,
    breakout_state: BreakoutState,
    breakout_rooms: Vec<BreakoutRoomInfo>,
    links: PeerArena,
    media: MediaTrackController,
    chat: Vec<ChatEntry>,
    speaker: ActiveSpeakerDetector,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionParticipant {
    pub fn new(
        info: ParticipantInfo,
        relay: Arc<dyn RelayClient>,
        factory: Arc<dyn LinkFactory>,
        devices: Arc<dyn MediaDevices>,
        config: ConferenceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            info,
            relay,
            factory,
            speaker: ActiveSpeakerDetector::new(config.speaker_threshold),
            config,
            room_id: None,
            scope: Scope::Main,
            host_id: None,
            roster: HashMap::new(),
            breakout_state: BreakoutState::MainOnly,
            breakout_rooms: Vec::new(),
            links: PeerArena::new(),
            media: MediaTrackController::new(devices),
            chat: Vec::new(),
            events,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ParticipantId {
        &self.info.id
    }

    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    #[must_use]
    pub const fn host_id(&self) -> Option<&ParticipantId> {
        self.host_id.as_ref()
    }

    /// Other members of the current scope, sorted by id
    #[must_use]
    pub fn roster(&self) -> Vec<&RosterEntry> {
        let mut entries: Vec<_> = self.roster.values().collect();
        entries.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        entries
    }

    #[must_use]
    pub const fn links(&self) -> &PeerArena {
        &self.links
    }

    #[must_use]
    pub fn link_state(&self, remote: &ParticipantId) -> Option<LinkState> {
        self.links.by_remote(remote).map(PeerHandle::state)
    }

    /// Tracks received from `remote`, audio first
    #[must_use]
    pub fn remote_tracks(&self, remote: &ParticipantId) -> Vec<RemoteTrack> {
        self.links
            .by_remote(remote)
            .map(PeerHandle::inbound_tracks)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn media_state(&self) -> MediaState {
        self.media.state()
    }

    #[must_use]
    pub fn chat_log(&self) -> &[ChatEntry] {
        &self.chat
    }

    #[must_use]
    pub const fn breakout_state(&self) -> BreakoutState {
        self.breakout_state
    }

    #[must_use]
    pub fn breakout_rooms(&self) -> &[BreakoutRoomInfo] {
        &self.breakout_rooms
    }

    #[must_use]
    pub fn is_speaking(&self, participant: &ParticipantId) -> bool {
        self.speaker.is_speaking(participant)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Acquire local media, register with the relay and initiate a link to
    /// every member of the joined scope.
    pub async fn join(&mut self, room_id: RoomId) -> Result<MembershipSnapshot> {
        if self.room_id.is_some() {
            return Err(Error::InvalidState(format!("{} already joined", self.info.id)));
        }

        let wanted = self.info.flags;
        for notice in self.media.start(wanted.mic_on, wanted.camera_on).await {
            warn!(participant_id = %self.info.id, error = %notice, "Media unavailable at join");
            self.emit(SessionEvent::HardwareNotice(notice));
        }
        let state = self.media.state();
        self.info.flags = MediaFlags {
            mic_on: state.mic_on,
            camera_on: state.camera_on,
            is_screen_sharing: false,
        };

        let snapshot = match self.relay.join(room_id.clone(), self.info.clone()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.media.shutdown();
                return Err(e);
            }
        };

        self.room_id = Some(snapshot.room_id.clone());
        self.host_id = snapshot.host_id.clone();
        self.breakout_state = snapshot.breakout_state;
        self.breakout_rooms = snapshot.breakout_rooms.clone();
        info!(
            participant_id = %self.info.id,
            room_id = %snapshot.room_id,
            members = snapshot.roster.len(),
            "Joined room"
        );
        self.emit(SessionEvent::Joined {
            room_id: snapshot.room_id.clone(),
            scope: snapshot.scope.clone(),
        });
        self.enter_scope(snapshot.scope.clone(), snapshot.roster.clone())
            .await;
        Ok(snapshot)
    }

    /// Leave the room, close every link and release local media. Safe to
    /// call when not joined.
    pub async fn leave(&mut self) {
        if self.room_id.take().is_some() {
            if let Err(e) = self.relay.leave().await {
                debug!(participant_id = %self.info.id, error = %e, "Relay leave failed");
            }
            self.emit(SessionEvent::Left);
        }
        self.links.close_all();
        self.media.shutdown();
        self.roster.clear();
        self.speaker.clear();
        self.scope = Scope::Main;
    }

    /// Apply one message delivered by the relay
    pub async fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::RoomJoined { snapshot } => {
                debug!(room_id = %snapshot.room_id, "Membership snapshot echoed by relay");
            }
            SignalMessage::UserJoined {
                participant_id,
                display_name,
                flags,
                is_host,
            } => {
                if is_host && self.host_id.is_none() {
                    self.host_id = Some(participant_id.clone());
                }
                self.roster.insert(
                    participant_id.clone(),
                    RosterEntry {
                        participant_id: participant_id.clone(),
                        display_name: display_name.clone(),
                        flags,
                        is_host,
                    },
                );
                self.emit(SessionEvent::ParticipantJoined {
                    participant_id: participant_id.clone(),
                    display_name,
                });
                // The newcomer sends the offer
                if let Err(e) = self.open_link(&participant_id, false).await {
                    warn!(remote = %participant_id, error = %e, "Failed to open link");
                }
            }
            SignalMessage::UserLeft { participant_id, .. } => {
                self.roster.remove(&participant_id);
                if self.host_id.as_ref() == Some(&participant_id) {
                    self.host_id = None;
                }
                self.drop_link(&participant_id);
                if self.speaker.forget(&participant_id) {
                    self.emit(SessionEvent::ActiveSpeaker {
                        participant_id: participant_id.clone(),
                        speaking: false,
                    });
                }
                self.emit(SessionEvent::ParticipantLeft { participant_id });
            }
            SignalMessage::Signal { sender_id, payload } => self.route_signal(sender_id, payload).await,
            SignalMessage::MicToggle { participant_id, on } => {
                self.update_flags(&participant_id, |f| f.mic_on = on);
            }
            SignalMessage::CameraToggle { participant_id, on } => {
                self.update_flags(&participant_id, |f| f.camera_on = on);
            }
            SignalMessage::ScreenShareStarted { participant_id } => {
                self.update_flags(&participant_id, |f| f.is_screen_sharing = true);
            }
            SignalMessage::ScreenShareStopped { participant_id } => {
                self.update_flags(&participant_id, |f| f.is_screen_sharing = false);
            }
            SignalMessage::ChatMessage {
                sender_id,
                sender_name,
                content,
                timestamp,
            } => {
                let entry = ChatEntry {
                    sender_id,
                    sender_name,
                    content,
                    timestamp,
                };
                self.chat.push(entry.clone());
                self.emit(SessionEvent::Chat(entry));
            }
            SignalMessage::BreakoutRoomsUpdate {
                state,
                rooms,
                host_id,
                ..
            } => {
                self.host_id = host_id;
                self.breakout_state = state;
                self.breakout_rooms = rooms.clone();
                self.emit(SessionEvent::BreakoutRoomsUpdated { state, rooms });
            }
            SignalMessage::ScopeChanged { scope, roster } => {
                info!(participant_id = %self.info.id, %scope, "Scope changed");
                self.emit(SessionEvent::ScopeChanged {
                    scope: scope.clone(),
                });
                self.enter_scope(scope, roster).await;
            }
            SignalMessage::BreakoutBroadcast {
                sender_id, message, ..
            } => {
                self.emit(SessionEvent::BreakoutBroadcast { sender_id, message });
            }
            SignalMessage::Ack {
                request_id,
                success,
                error,
                ..
            } => {
                debug!(?request_id, success, ?error, "Ack received");
            }
            SignalMessage::Error { message } => {
                warn!(participant_id = %self.info.id, %message, "Relay reported an error");
                self.emit(SessionEvent::RelayError { message });
            }
        }
    }

    pub async fn set_mic(&mut self, on: bool) -> Result<()> {
        let result = self.media.set_mic(on, &self.links).await;
        self.settle_media(result, ScopeEvent::MicToggle {
            on: self.media.state().mic_on,
        })
        .await
    }

    pub async fn set_camera(&mut self, on: bool) -> Result<()> {
        let result = self.media.set_camera(on, &self.links).await;
        self.settle_media(result, ScopeEvent::CameraToggle {
            on: self.media.state().camera_on,
        })
        .await
    }

    pub async fn start_screen_share(&mut self) -> Result<()> {
        match self.media.start_screen_share(&self.links).await {
            Ok(()) => {
                self.publish(ScopeEvent::ScreenShareStarted).await;
                Ok(())
            }
            Err(Error::Hardware(notice)) => {
                self.emit(SessionEvent::HardwareNotice(notice));
                Err(Error::Hardware(notice))
            }
            Err(e) => Err(e),
        }
    }

    /// Stop sharing, explicitly or because the capture ended. Either way the
    /// camera is restored if it was on.
    pub async fn stop_screen_share(&mut self) -> Result<()> {
        if self.media.screen_track().is_none() {
            return Ok(());
        }
        let camera_was_on = self.media.state().camera_on;
        let result = self.media.finish_screen_share(&self.links).await;
        self.publish(ScopeEvent::ScreenShareStopped).await;
        if camera_was_on && !self.media.state().camera_on {
            self.publish(ScopeEvent::CameraToggle { on: false }).await;
        }
        if let Err(Error::Hardware(notice)) = &result {
            self.emit(SessionEvent::HardwareNotice(*notice));
        }
        result
    }

    pub async fn send_chat(&mut self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.relay
            .publish(ScopeEvent::Chat {
                content: content.clone(),
            })
            .await?;
        let entry = ChatEntry {
            sender_id: self.info.id.clone(),
            sender_name: self.info.display_name.clone(),
            content,
            timestamp: Utc::now(),
        };
        self.chat.push(entry.clone());
        self.emit(SessionEvent::Chat(entry));
        Ok(())
    }

    /// Host or self-service breakout operation. Scope changes it causes
    /// arrive back through the relay as `scope-changed`.
    pub async fn breakout(&mut self, command: BreakoutCommand) -> Result<BreakoutOutcome> {
        let name = command.name();
        let outcome = self.relay.breakout(command).await;
        if let Err(e) = &outcome {
            debug!(participant_id = %self.info.id, command = name, error = %e, "Breakout command rejected");
        }
        outcome
    }

    pub fn report_audio_level(&mut self, participant: ParticipantId, level: f32) {
        self.speaker.report_level(participant, level);
    }

    /// Re-evaluate speaking state, emitting events for changes only
    pub fn sample_speakers(&mut self) {
        let local = &self.info.id;
        let local_mic = self.media.state().mic_on;
        let roster = &self.roster;
        let changes = self.speaker.sample(|id| {
            if id == local {
                local_mic
            } else {
                roster.get(id).is_some_and(|e| e.flags.mic_on)
            }
        });
        for (participant_id, speaking) in changes {
            self.emit(SessionEvent::ActiveSpeaker {
                participant_id,
                speaking,
            });
        }
    }

    /// Periodic housekeeping: speaker sampling and removal of links that
    /// closed on their own
    pub fn tick(&mut self) {
        self.sample_speakers();
        for key in self.links.prune_closed() {
            debug!(participant_id = %self.info.id, link = %key, "Pruned closed link");
        }
    }

    pub async fn apply(&mut self, intent: Intent) -> Result<()> {
        match intent {
            Intent::SetMic(on) => self.set_mic(on).await,
            Intent::SetCamera(on) => self.set_camera(on).await,
            Intent::StartScreenShare => self.start_screen_share().await,
            Intent::StopScreenShare => self.stop_screen_share().await,
            Intent::Chat(content) => self.send_chat(content).await,
            Intent::Breakout(command) => self.breakout(command).await.map(|_| ()),
            Intent::AudioLevel {
                participant_id,
                level,
            } => {
                self.report_audio_level(participant_id, level);
                Ok(())
            }
            Intent::Leave => {
                self.leave().await;
                Ok(())
            }
        }
    }

    /// Drive the participant until it leaves or the relay connection closes
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<SignalMessage>,
        mut intents: mpsc::UnboundedReceiver<Intent>,
    ) {
        let mut ticker = tokio::time::interval(self.config.speaker_sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let screen = self.media.screen_track();
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        warn!(participant_id = %self.info.id, "Relay connection closed");
                        break;
                    }
                },
                intent = intents.recv() => match intent {
                    Some(Intent::Leave) | None => break,
                    Some(intent) => {
                        if let Err(e) = self.apply(intent).await {
                            debug!(participant_id = %self.info.id, error = %e, "Intent failed");
                        }
                    }
                },
                _ = ticker.tick() => self.tick(),
                () = async {
                    match &screen {
                        Some(track) => track.ended().await,
                        None => std::future::pending().await,
                    }
                } => {
                    debug!(participant_id = %self.info.id, "Screen capture ended");
                    if let Err(e) = self.stop_screen_share().await {
                        debug!(error = %e, "Camera not restored after screen share");
                    }
                }
            }
        }

        self.leave().await;
    }

    /// Replace the mesh with links to `roster`, initiating each one
    async fn enter_scope(&mut self, scope: Scope, roster: Vec<RosterEntry>) {
        self.links.close_all();
        self.speaker.clear();
        self.scope = scope;
        self.roster = roster
            .into_iter()
            .filter(|e| e.participant_id != self.info.id)
            .map(|e| (e.participant_id.clone(), e))
            .collect();

        let mut remotes: Vec<_> = self.roster.keys().cloned().collect();
        remotes.sort();
        for remote in remotes {
            if let Err(e) = self.open_link(&remote, true).await {
                warn!(remote = %remote, error = %e, "Failed to open link");
            }
        }
    }

    async fn open_link(&mut self, remote: &ParticipantId, initiate: bool) -> Result<()> {
        let key = PairKey::new(self.info.id.clone(), remote.clone())
            .ok_or_else(|| Error::InvalidInput(format!("cannot link {remote} to itself")))?;
        if self.links.get(&key).is_some_and(|h| !h.is_closed()) {
            return Ok(());
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let link = self.factory.create(&key, inbound_tx).await?;
        let manager =
            PeerConnectionManager::new(self.info.id.clone(), remote.clone(), link, self.relay.clone())?
                .with_inbound(inbound_rx);
        let handle = PeerHandle::spawn(manager, self.config.negotiation_timeout());

        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(track) = self.media.outbound(kind) {
                handle.replace_track(kind, Some(track));
            }
        }

        let mut states = handle.subscribe();
        let mut inbound = handle.subscribe_inbound();
        let events = self.events.clone();
        let participant_id = remote.clone();
        tokio::spawn(async move {
            let mut announced: Vec<RemoteTrack> = Vec::new();
            loop {
                tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        let _ = events.send(SessionEvent::LinkStateChanged {
                            participant_id: participant_id.clone(),
                            state,
                        });
                        if state == LinkState::Closed {
                            break;
                        }
                    }
                    Ok(()) = inbound.changed() => {
                        let tracks = inbound.borrow_and_update().clone();
                        for track in tracks.iter().filter(|t| !announced.contains(t)) {
                            let _ = events.send(SessionEvent::RemoteTrack {
                                participant_id: participant_id.clone(),
                                track: track.clone(),
                            });
                        }
                        announced = tracks;
                    }
                }
            }
        });

        if initiate {
            handle.initiate();
        }
        self.links.insert(handle)
    }

    fn drop_link(&mut self, remote: &ParticipantId) {
        if let Some(key) = PairKey::new(self.info.id.clone(), remote.clone()) {
            self.links.remove(&key);
        }
    }

    async fn route_signal(&mut self, sender: ParticipantId, payload: NegotiationPayload) {
        let Some(key) = PairKey::new(self.info.id.clone(), sender.clone()) else {
            return;
        };
        let live = self.links.get(&key).is_some_and(|h| !h.is_closed());
        if !live {
            // A fresh offer from a co-scoped member retries a failed link
            let retry = matches!(payload, NegotiationPayload::Offer { .. })
                && self.roster.contains_key(&sender);
            if !retry {
                debug!(sender_id = %sender, kind = payload.kind(), "Signal for unknown link dropped");
                return;
            }
            if let Err(e) = self.open_link(&sender, false).await {
                warn!(remote = %sender, error = %e, "Failed to reopen link");
                return;
            }
        }
        if let Some(handle) = self.links.get(&key) {
            handle.signal(payload);
        }
    }

    fn update_flags(&mut self, participant: &ParticipantId, update: impl FnOnce(&mut MediaFlags)) {
        let Some(entry) = self.roster.get_mut(participant) else {
            return;
        };
        update(&mut entry.flags);
        let flags = entry.flags;
        self.emit(SessionEvent::MediaChanged {
            participant_id: participant.clone(),
            flags,
        });
    }

    /// Publish the resulting toggle state and turn hardware failures into
    /// notices
    async fn settle_media(&mut self, result: Result<()>, event: ScopeEvent) -> Result<()> {
        self.publish(event).await;
        if let Err(Error::Hardware(notice)) = &result {
            warn!(participant_id = %self.info.id, error = %notice, "Media toggle fell back to off");
            self.emit(SessionEvent::HardwareNotice(*notice));
        }
        result
    }

    async fn publish(&mut self, event: ScopeEvent) {
        let state = self.media.state();
        self.info.flags = MediaFlags {
            mic_on: state.mic_on,
            camera_on: state.camera_on,
            is_screen_sharing: state.screen_sharing,
        };
        if self.room_id.is_none() {
            return;
        }
        match self.relay.publish(event).await {
            Ok(report) if !report.is_complete() => {
                debug!(unreachable = ?report.unreachable, "Toggle not delivered to everyone");
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Toggle publish failed"),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
