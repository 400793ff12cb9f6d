//! Signaling relay
//!
//! Routes control and negotiation messages between participants. It keeps
//! room membership and nothing else; no media passes through it.
//!
//! Each room sits behind its own mutex inside a concurrent map. Lock order is
//! always map shard first, then room; a map guard is never held while a room
//! is locked.

mod client;

pub use client::{LocalRelayClient, RelayClient};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    BreakoutCommand, BreakoutRoomInfo, BreakoutState, ClientFrame, ClientRequest,
    MembershipSnapshot, NegotiationPayload, RosterEntry, ScopeEvent, SignalMessage, Target,
};
use crate::room::{Outbox, ParticipantInfo, Room};
use crate::types::{BreakoutRoomId, ParticipantId, RoomId, Scope};

/// Result of a send. Unreachable recipients are a soft failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Recipients that were gone or not in the sender's scope
    pub unreachable: Vec<ParticipantId>,
}

impl DeliveryReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }
}

/// Acknowledged result of a breakout command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakoutOutcome {
    pub created: Option<BreakoutRoomId>,
    pub moved: usize,
    pub delivery: DeliveryReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    #[serde(flatten)]
    pub entry: RosterEntry,
    pub scope: Scope,
}

/// Monitoring view of one room
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub host_id: Option<ParticipantId>,
    pub participants: Vec<ParticipantSummary>,
    pub breakout_state: BreakoutState,
    pub breakout_rooms: Vec<BreakoutRoomInfo>,
    pub created_at: DateTime<Utc>,
}

/// Collects delivery results while a room is locked
#[derive(Default)]
struct Delivery {
    report: DeliveryReport,
    closed: Vec<ParticipantId>,
}

impl Delivery {
    fn to(&mut self, room: &Room, recipient: &ParticipantId, message: SignalMessage) {
        let Some(participant) = room.roster().get(recipient) else {
            self.report.unreachable.push(recipient.clone());
            return;
        };
        if participant.deliver(message) {
            self.report.delivered += 1;
        } else {
            self.report.unreachable.push(recipient.clone());
            self.closed.push(recipient.clone());
        }
    }

    fn to_scope(
        &mut self,
        room: &Room,
        scope: &Scope,
        except: Option<&ParticipantId>,
        message: &SignalMessage,
    ) {
        let recipients: Vec<ParticipantId> = room
            .roster()
            .in_scope(scope)
            .filter(|p| Some(&p.id) != except)
            .map(|p| p.id.clone())
            .collect();
        for id in recipients {
            self.to(room, &id, message.clone());
        }
    }

    fn to_everyone(&mut self, room: &Room, message: &SignalMessage) {
        let recipients: Vec<ParticipantId> = room.roster().iter().map(|p| p.id.clone()).collect();
        for id in recipients {
            self.to(room, &id, message.clone());
        }
    }
}

/// Server-side membership tables and message router
pub struct SignalingRelay {
    rooms: DashMap<RoomId, Arc<Mutex<Room>>>,
    /// Participant → room, for routing by sender
    index: DashMap<ParticipantId, RoomId>,
    config: RelayConfig,
}

impl SignalingRelay {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            index: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn room_of(&self, participant: &ParticipantId) -> Option<RoomId> {
        self.index.get(participant).map(|r| r.value().clone())
    }

    /// Current scope of a participant
    #[must_use]
    pub fn scope_of(&self, participant: &ParticipantId) -> Option<Scope> {
        let room = self.room(&self.room_of(participant)?)?;
        let guard = room.lock();
        guard.roster().scope_of(participant).cloned()
    }

    /// Admit a participant to a room, creating the room on first join.
    ///
    /// The joiner receives `room-joined` before any other message; everyone
    /// already in the main scope receives `user-joined`.
    pub fn join(
        &self,
        room_id: RoomId,
        info: ParticipantInfo,
        outbox: Outbox,
    ) -> Result<MembershipSnapshot> {
        self.validate_name("display name", &info.display_name)?;

        let participant_id = info.id.clone();
        match self.index.entry(participant_id.clone()) {
            Entry::Occupied(entry) => {
                return Err(Error::AlreadyExists(format!(
                    "participant {participant_id} is already in room {}",
                    entry.get()
                )));
            }
            Entry::Vacant(entry) => {
                entry.insert(room_id.clone());
            }
        }

        let result = self.admit(&room_id, info, outbox);
        match &result {
            Ok((snapshot, _)) => {
                info!(
                    room_id = %room_id,
                    participant_id = %participant_id,
                    host = ?snapshot.host_id,
                    members = snapshot.roster.len() + 1,
                    "Participant joined room"
                );
            }
            Err(e) => {
                self.index.remove(&participant_id);
                warn!(room_id = %room_id, participant_id = %participant_id, error = %e, "Join rejected");
            }
        }

        let (snapshot, closed) = result?;
        self.reap(closed);
        Ok(snapshot)
    }

    fn admit(
        &self,
        room_id: &RoomId,
        info: ParticipantInfo,
        outbox: Outbox,
    ) -> Result<(MembershipSnapshot, Vec<ParticipantId>)> {
        loop {
            let room = self
                .rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id.clone(), &self.config))))
                .value()
                .clone();

            let mut guard = room.lock();
            if guard.is_ended() {
                // Lost a race with the last leaver; retry on a fresh room
                drop(guard);
                self.rooms.remove_if(room_id, |_, r| Arc::ptr_eq(r, &room));
                continue;
            }

            let limit = self.config.max_participants_per_room;
            if limit > 0 && guard.roster().len() >= limit {
                return Err(Error::CapacityExceeded(format!(
                    "room {room_id} is full ({limit} participants)"
                )));
            }

            let joined = guard.admit(info, outbox)?.clone();
            let snapshot = guard.snapshot_for(&joined.id)?;

            joined.deliver(SignalMessage::RoomJoined {
                snapshot: snapshot.clone(),
            });

            let mut delivery = Delivery::default();
            delivery.to_scope(
                &guard,
                &Scope::Main,
                Some(&joined.id),
                &SignalMessage::UserJoined {
                    participant_id: joined.id.clone(),
                    display_name: joined.display_name.clone(),
                    flags: joined.flags,
                    is_host: joined.is_host,
                },
            );
            return Ok((snapshot, delivery.closed));
        }
    }

    /// Explicit leave of `room_id`
    pub fn leave(&self, room_id: &RoomId, participant: &ParticipantId) -> Result<()> {
        match self.room_of(participant) {
            Some(current) if &current == room_id => self.depart(participant),
            _ => Err(Error::NotFound(format!(
                "participant {participant} in room {room_id}"
            ))),
        }
    }

    /// Transport-level drop; same effect as a leave, and a no-op for unknown ids
    pub fn disconnect(&self, participant: &ParticipantId) {
        if self.index.contains_key(participant) {
            debug!(participant_id = %participant, "Participant disconnected");
            if let Err(e) = self.depart(participant) {
                debug!(participant_id = %participant, error = %e, "Disconnect raced with leave");
            }
        }
    }

    fn depart(&self, participant: &ParticipantId) -> Result<()> {
        let (_, room_id) = self
            .index
            .remove(participant)
            .ok_or_else(|| Error::NotFound(format!("participant {participant}")))?;
        let Some(room) = self.room(&room_id) else {
            return Ok(());
        };

        let mut delivery = Delivery::default();
        let ended = {
            let mut guard = room.lock();
            let Some((left, scope)) = guard.remove(participant) else {
                return Ok(());
            };

            delivery.to_scope(
                &guard,
                &scope,
                None,
                &SignalMessage::UserLeft {
                    participant_id: left.id.clone(),
                    display_name: left.display_name.clone(),
                },
            );
            if !scope.is_main() {
                let update = Self::breakout_update(&guard);
                delivery.to_everyone(&guard, &update);
            }

            if guard.roster().is_empty() {
                guard.ended = true;
            }
            debug_assert!(guard.check_invariants().is_ok());
            guard.is_ended()
        };

        info!(room_id = %room_id, participant_id = %participant, "Participant left room");
        if ended {
            self.rooms.remove_if(&room_id, |_, r| Arc::ptr_eq(r, &room));
            info!(room_id = %room_id, "Room ended");
        }

        self.reap(delivery.closed);
        Ok(())
    }

    /// Send `message` to one participant or to the rest of the sender's scope
    pub fn send(
        &self,
        sender: &ParticipantId,
        target: Target,
        message: SignalMessage,
    ) -> Result<DeliveryReport> {
        let room = self.sender_room(sender)?;
        let delivery = {
            let guard = room.lock();
            let scope = guard
                .roster()
                .scope_of(sender)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("participant {sender}")))?;
            Self::deliver_to_target(&guard, sender, &scope, target, message)
        };
        Ok(self.finish(delivery))
    }

    /// Forward a negotiation payload to `target`
    pub fn signal(
        &self,
        sender: &ParticipantId,
        target: &ParticipantId,
        payload: NegotiationPayload,
    ) -> Result<DeliveryReport> {
        let kind = payload.kind();
        let report = self.send(
            sender,
            Target::Participant(target.clone()),
            SignalMessage::Signal {
                sender_id: sender.clone(),
                payload,
            },
        )?;
        if !report.is_complete() {
            debug!(sender_id = %sender, target_id = %target, kind, "Signal target unreachable");
        }
        Ok(report)
    }

    /// Publish a toggle or chat message to the sender's scope, updating the
    /// sender's advertised media flags on the way.
    pub fn publish(&self, sender: &ParticipantId, event: ScopeEvent) -> Result<DeliveryReport> {
        if let ScopeEvent::Chat { content } = &event {
            if content.trim().is_empty() {
                return Err(Error::InvalidInput("chat message is empty".into()));
            }
            if content.chars().count() > self.config.max_chat_len {
                return Err(Error::InvalidInput(format!(
                    "chat message longer than {} characters",
                    self.config.max_chat_len
                )));
            }
        }

        let room = self.sender_room(sender)?;
        let delivery = {
            let mut guard = room.lock();
            let participant = guard
                .roster_mut()
                .get_mut(sender)
                .ok_or_else(|| Error::NotFound(format!("participant {sender}")))?;
            let id = participant.id.clone();
            let message = match event {
                ScopeEvent::MicToggle { on } => {
                    participant.flags.mic_on = on;
                    SignalMessage::MicToggle { participant_id: id, on }
                }
                ScopeEvent::CameraToggle { on } => {
                    participant.flags.camera_on = on;
                    SignalMessage::CameraToggle { participant_id: id, on }
                }
                ScopeEvent::ScreenShareStarted => {
                    participant.flags.is_screen_sharing = true;
                    SignalMessage::ScreenShareStarted { participant_id: id }
                }
                ScopeEvent::ScreenShareStopped => {
                    participant.flags.is_screen_sharing = false;
                    SignalMessage::ScreenShareStopped { participant_id: id }
                }
                ScopeEvent::Chat { content } => SignalMessage::ChatMessage {
                    sender_id: id,
                    sender_name: participant.display_name.clone(),
                    content,
                    timestamp: Utc::now(),
                },
            };
            let scope = participant.scope().clone();
            Self::deliver_to_target(&guard, sender, &scope, Target::Scope, message)
        };
        Ok(self.finish(delivery))
    }

    /// Apply a breakout command on behalf of `actor`.
    ///
    /// Moved participants get `scope-changed`, the scopes they leave and
    /// enter get `user-left` / `user-joined`, and the whole room gets a
    /// fresh `breakout-rooms-update`.
    pub fn breakout(
        &self,
        room_id: &RoomId,
        actor: &ParticipantId,
        command: BreakoutCommand,
    ) -> Result<BreakoutOutcome> {
        if self.room_of(actor).as_ref() != Some(room_id) {
            return Err(Error::PermissionDenied(format!(
                "{actor} is not a member of room {room_id}"
            )));
        }
        let room = self
            .room(room_id)
            .ok_or_else(|| Error::NotFound(format!("room {room_id}")))?;

        let name = command.name();
        let broadcast = match &command {
            BreakoutCommand::Broadcast { message } => Some(message.clone()),
            _ => None,
        };

        let (outcome, delivery) = {
            let mut guard = room.lock();
            let outcome = guard.apply_breakout(actor, command)?;

            let mut delivery = Delivery::default();
            for (recipient, message) in guard.scope_change_notices(&outcome.changes) {
                delivery.to(&guard, &recipient, message);
            }
            match broadcast {
                Some(message) => {
                    let notice = SignalMessage::BreakoutBroadcast {
                        sender_id: actor.clone(),
                        message,
                        timestamp: Utc::now(),
                    };
                    for recipient in &outcome.broadcast_to {
                        delivery.to(&guard, recipient, notice.clone());
                    }
                }
                None => {
                    let update = Self::breakout_update(&guard);
                    delivery.to_everyone(&guard, &update);
                }
            }
            (outcome, delivery)
        };

        info!(
            room_id = %room_id,
            actor = %actor,
            command = name,
            moved = outcome.changes.len(),
            "Breakout command applied"
        );

        Ok(BreakoutOutcome {
            created: outcome.created,
            moved: outcome.changes.len(),
            delivery: self.finish(delivery),
        })
    }

    /// Monitoring snapshot of a room
    #[must_use]
    pub fn room_snapshot(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        let room = self.room(room_id)?;
        let guard = room.lock();
        if guard.is_ended() {
            return None;
        }

        let mut participants: Vec<ParticipantSummary> = guard
            .roster()
            .iter()
            .map(|p| ParticipantSummary {
                entry: p.entry(),
                scope: p.scope().clone(),
            })
            .collect();
        participants.sort_by(|a, b| a.entry.participant_id.cmp(&b.entry.participant_id));

        Some(RoomSnapshot {
            room_id: guard.id.clone(),
            host_id: guard.host().cloned(),
            participants,
            breakout_state: guard.breakout().state(),
            breakout_rooms: guard.breakout().rooms_info(),
            created_at: guard.created_at,
        })
    }

    /// Handle a wire request from an already-joined participant. Returns the
    /// reply to send back, if any.
    pub fn dispatch(&self, sender: &ParticipantId, frame: ClientFrame) -> Option<SignalMessage> {
        let ClientFrame { request_id, request } = frame;

        match request {
            ClientRequest::JoinRoom { .. } => Some(SignalMessage::error("already joined a room")),
            ClientRequest::LeaveRoom => {
                let result = self
                    .room_of(sender)
                    .ok_or_else(|| Error::NotFound(format!("participant {sender}")))
                    .and_then(|room_id| self.leave(&room_id, sender));
                match result {
                    Ok(()) => request_id.map(|id| SignalMessage::ack_ok(Some(id), None)),
                    Err(e) => Some(SignalMessage::error(e.to_string())),
                }
            }
            ClientRequest::Signal { target_id, payload } => {
                match self.signal(sender, &target_id, payload) {
                    Ok(_) => None,
                    Err(e) => Some(SignalMessage::error(e.to_string())),
                }
            }
            request @ (ClientRequest::MicToggle { .. }
            | ClientRequest::CameraToggle { .. }
            | ClientRequest::ScreenShareStarted
            | ClientRequest::ScreenShareStopped
            | ClientRequest::ChatMessage { .. }) => {
                let event = request.into_scope_event()?;
                match self.publish(sender, event) {
                    Ok(_) => None,
                    Err(e) => Some(SignalMessage::error(e.to_string())),
                }
            }
            request => {
                let (room_id, command) = request.into_breakout()?;
                match self.breakout(&room_id, sender, command) {
                    Ok(outcome) => Some(SignalMessage::ack_ok(request_id, outcome.created)),
                    Err(e) => {
                        debug!(participant_id = %sender, error = %e, "Breakout command rejected");
                        Some(SignalMessage::ack_failed(request_id, e))
                    }
                }
            }
        }
    }

    fn room(&self, room_id: &RoomId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    fn sender_room(&self, sender: &ParticipantId) -> Result<Arc<Mutex<Room>>> {
        self.room_of(sender)
            .and_then(|room_id| self.room(&room_id))
            .ok_or_else(|| Error::NotFound(format!("participant {sender} is not in a room")))
    }

    fn deliver_to_target(
        room: &Room,
        sender: &ParticipantId,
        scope: &Scope,
        target: Target,
        message: SignalMessage,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        match target {
            Target::Participant(recipient) => {
                let same_scope = room.roster().scope_of(&recipient) == Some(scope);
                if same_scope && &recipient != sender {
                    delivery.to(room, &recipient, message);
                } else {
                    delivery.report.unreachable.push(recipient);
                }
            }
            Target::Scope => delivery.to_scope(room, scope, Some(sender), &message),
        }
        delivery
    }

    fn breakout_update(room: &Room) -> SignalMessage {
        SignalMessage::BreakoutRoomsUpdate {
            main_room_id: room.id.clone(),
            state: room.breakout().state(),
            rooms: room.breakout().rooms_info(),
            host_id: room.host().cloned(),
        }
    }

    fn finish(&self, delivery: Delivery) -> DeliveryReport {
        self.reap(delivery.closed);
        delivery.report
    }

    /// Drop participants whose delivery channel is closed
    fn reap(&self, closed: Vec<ParticipantId>) {
        for participant in closed {
            warn!(participant_id = %participant, "Delivery channel closed, removing participant");
            self.disconnect(&participant);
        }
    }

    fn validate_name(&self, what: &str, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput(format!("{what} is empty")));
        }
        if name.chars().count() > self.config.max_name_len {
            return Err(Error::InvalidInput(format!(
                "{what} longer than {} characters",
                self.config.max_name_len
            )));
        }
        Ok(())
    }
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
