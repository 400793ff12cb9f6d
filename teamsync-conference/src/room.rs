//! Room membership model
//!
//! A [`Room`] is the unit of per-room exclusion in the relay: every structural
//! mutation happens through `&mut Room` while the relay holds that room's lock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::breakout::{BreakoutRoomCoordinator, ScopeChange};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::{BreakoutCommand, MembershipSnapshot, RosterEntry, SignalMessage};
use crate::types::{BreakoutRoomId, MediaFlags, ParticipantId, RoomId, Scope};

/// Outbound delivery channel of one connected participant
pub type Outbox = mpsc::UnboundedSender<SignalMessage>;

/// Identity a participant presents when joining
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub display_name: String,
    pub is_host: bool,
    pub flags: MediaFlags,
}

impl ParticipantInfo {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_host: false,
            flags: MediaFlags::default(),
        }
    }

    #[must_use]
    pub const fn with_host(mut self, is_host: bool) -> Self {
        self.is_host = is_host;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: MediaFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A connected room member
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub flags: MediaFlags,
    pub is_host: bool,
    scope: Scope,
    outbox: Outbox,
}

impl Participant {
    #[must_use]
    pub fn new(info: ParticipantInfo, outbox: Outbox) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            flags: info.flags,
            is_host: false,
            scope: Scope::Main,
            outbox,
        }
    }

    #[must_use]
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Queue a message; `false` when the connection is already gone
    pub fn deliver(&self, message: SignalMessage) -> bool {
        self.outbox.send(message).is_ok()
    }

    #[must_use]
    pub fn entry(&self) -> RosterEntry {
        RosterEntry {
            participant_id: self.id.clone(),
            display_name: self.display_name.clone(),
            flags: self.flags,
            is_host: self.is_host,
        }
    }
}

/// Participants of a room and the scope each one is in.
///
/// Scopes are only written through [`BreakoutRoomCoordinator`], which keeps
/// breakout member sets consistent with them.
#[derive(Debug, Default)]
pub struct Roster {
    members: HashMap<ParticipantId, Participant>,
}

impl Roster {
    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.members.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.members.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.members.values()
    }

    #[must_use]
    pub fn scope_of(&self, id: &ParticipantId) -> Option<&Scope> {
        self.members.get(id).map(Participant::scope)
    }

    /// Members currently in `scope`
    pub fn in_scope<'a>(&'a self, scope: &'a Scope) -> impl Iterator<Item = &'a Participant> + 'a {
        self.members.values().filter(move |p| &p.scope == scope)
    }

    pub(crate) fn insert(&mut self, participant: Participant) {
        self.members.insert(participant.id.clone(), participant);
    }

    pub(crate) fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.members.remove(id)
    }

    pub(crate) fn set_scope(&mut self, id: &ParticipantId, scope: Scope) -> Option<Scope> {
        self.members
            .get_mut(id)
            .map(|p| std::mem::replace(&mut p.scope, scope))
    }
}

/// What a breakout command changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Scope moves in the order they were applied
    pub changes: Vec<ScopeChange>,
    /// Set by `CreateRoom`
    pub created: Option<BreakoutRoomId>,
    /// Set by `Broadcast`: recipients across every breakout room
    pub broadcast_to: Vec<ParticipantId>,
}

/// Top-level meeting scope
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    host: Option<ParticipantId>,
    roster: Roster,
    breakout: BreakoutRoomCoordinator,
    pub created_at: DateTime<Utc>,
    /// Set once the last participant left; a joiner seeing it must retry
    pub(crate) ended: bool,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId, config: &RelayConfig) -> Self {
        Self {
            breakout: BreakoutRoomCoordinator::new(id.clone(), config),
            id,
            host: None,
            roster: Roster::default(),
            created_at: Utc::now(),
            ended: false,
        }
    }

    #[must_use]
    pub const fn host(&self) -> Option<&ParticipantId> {
        self.host.as_ref()
    }

    #[must_use]
    pub fn is_host(&self, id: &ParticipantId) -> bool {
        self.host.as_ref() == Some(id)
    }

    #[must_use]
    pub const fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    #[must_use]
    pub const fn breakout(&self) -> &BreakoutRoomCoordinator {
        &self.breakout
    }

    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    /// Add a participant to the main scope. A host claim succeeds only while
    /// the host slot is empty.
    pub fn admit(&mut self, info: ParticipantInfo, outbox: Outbox) -> Result<&Participant> {
        if self.roster.contains(&info.id) {
            return Err(Error::AlreadyExists(format!(
                "participant {} in room {}",
                info.id, self.id
            )));
        }

        let claims_host = info.is_host;
        let id = info.id.clone();
        let mut participant = Participant::new(info, outbox);
        if claims_host && self.host.is_none() {
            self.host = Some(id.clone());
            participant.is_host = true;
        }
        self.roster.insert(participant);

        self.roster
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("participant {id}")))
    }

    /// Remove a participant from the room and from any breakout room.
    ///
    /// Returns the participant and the scope it was in.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<(Participant, Scope)> {
        self.breakout.forget(id);
        let participant = self.roster.remove(id)?;
        if self.host.as_ref() == Some(id) {
            self.host = None;
        }
        let scope = participant.scope.clone();
        Some((participant, scope))
    }

    /// Apply a breakout command issued by `actor`
    pub fn apply_breakout(
        &mut self,
        actor: &ParticipantId,
        command: BreakoutCommand,
    ) -> Result<CommandOutcome> {
        if !self.roster.contains(actor) {
            return Err(Error::NotFound(format!("participant {actor} in room {}", self.id)));
        }
        let is_host = self.is_host(actor);
        if command.requires_host() && !is_host {
            return Err(Error::PermissionDenied(format!(
                "{} requires the host",
                command.name()
            )));
        }

        let mut outcome = CommandOutcome::default();
        match command {
            BreakoutCommand::CreateRoom { name } => {
                outcome.created = Some(self.breakout.create_room(&name)?.id.clone());
            }
            BreakoutCommand::Assign { assignments } => {
                outcome.changes = self.breakout.assign(&mut self.roster, &assignments)?;
            }
            BreakoutCommand::JoinRoom { breakout_room_id } => {
                outcome.changes = self
                    .breakout
                    .join_room(&mut self.roster, actor, is_host, &breakout_room_id)?
                    .into_iter()
                    .collect();
            }
            BreakoutCommand::ReturnToMain => {
                outcome.changes = self
                    .breakout
                    .return_to_main(&mut self.roster, actor)
                    .into_iter()
                    .collect();
            }
            BreakoutCommand::CloseRoom { breakout_room_id } => {
                outcome.changes = self.breakout.close_room(&mut self.roster, &breakout_room_id)?;
            }
            BreakoutCommand::CloseAll => {
                outcome.changes = self.breakout.close_all(&mut self.roster);
            }
            BreakoutCommand::Broadcast { .. } => {
                outcome.broadcast_to = self.breakout.broadcast_recipients(&self.roster)?;
            }
        }

        debug_assert!(self.check_invariants().is_ok(), "{:?}", self.check_invariants());
        Ok(outcome)
    }

    /// Other members of `scope`, as roster entries
    #[must_use]
    pub fn roster_entries(&self, scope: &Scope, exclude: &ParticipantId) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .roster
            .in_scope(scope)
            .filter(|p| &p.id != exclude)
            .map(Participant::entry)
            .collect();
        entries.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        entries
    }

    /// Membership view for `id`
    pub fn snapshot_for(&self, id: &ParticipantId) -> Result<MembershipSnapshot> {
        let scope = self
            .roster
            .scope_of(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("participant {id} in room {}", self.id)))?;

        Ok(MembershipSnapshot {
            room_id: self.id.clone(),
            participant_id: id.clone(),
            roster: self.roster_entries(&scope, id),
            scope,
            host_id: self.host.clone(),
            breakout_state: self.breakout.state(),
            breakout_rooms: self.breakout.rooms_info(),
        })
    }

    /// Notifications for a batch of scope moves.
    ///
    /// Moves are replayed one at a time against the pre-batch membership, so
    /// every pair that ends up sharing a scope learns about each other exactly
    /// once: the mover through `scope-changed` (and initiates), the members
    /// already there through `user-joined` (and answer).
    #[must_use]
    pub fn scope_change_notices(&self, changes: &[ScopeChange]) -> Vec<(ParticipantId, SignalMessage)> {
        let mut scopes: HashMap<&ParticipantId, &Scope> = self
            .roster
            .iter()
            .map(|p| (&p.id, &p.scope))
            .collect();
        // Rewind movers to where the batch found them
        for change in changes.iter().rev() {
            if scopes.contains_key(&change.participant_id) {
                scopes.insert(&change.participant_id, &change.from);
            }
        }

        let mut notices = Vec::new();
        for change in changes {
            let Some(mover) = self.roster.get(&change.participant_id) else {
                continue;
            };

            let mut roster = Vec::new();
            for (id, scope) in &scopes {
                if *id == &mover.id {
                    continue;
                }
                if *scope == &change.from {
                    notices.push((
                        (*id).clone(),
                        SignalMessage::UserLeft {
                            participant_id: mover.id.clone(),
                            display_name: mover.display_name.clone(),
                        },
                    ));
                } else if *scope == &change.to {
                    notices.push((
                        (*id).clone(),
                        SignalMessage::UserJoined {
                            participant_id: mover.id.clone(),
                            display_name: mover.display_name.clone(),
                            flags: mover.flags,
                            is_host: mover.is_host,
                        },
                    ));
                    if let Some(member) = self.roster.get(id) {
                        roster.push(member.entry());
                    }
                }
            }
            roster.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

            notices.push((
                mover.id.clone(),
                SignalMessage::ScopeChanged {
                    scope: change.to.clone(),
                    roster,
                },
            ));
            scopes.insert(&mover.id, &change.to);
        }
        notices
    }

    /// Verify scope exclusivity, breakout membership ⊆ roster, and that no
    /// participant is scoped to a closed or missing breakout room.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for participant in self.roster.iter() {
            if let Scope::Breakout(room_id) = participant.scope() {
                let room = self.breakout.room(room_id).ok_or_else(|| {
                    format!("{} scoped to missing breakout room {room_id}", participant.id)
                })?;
                if !room.open {
                    return Err(format!(
                        "{} scoped to closed breakout room {room_id}",
                        participant.id
                    ));
                }
                if !room.participants.contains(&participant.id) {
                    return Err(format!(
                        "{} scoped to {room_id} but missing from its member set",
                        participant.id
                    ));
                }
            }
        }

        for room in self.breakout.rooms() {
            for member in &room.participants {
                match self.roster.scope_of(member) {
                    None => {
                        return Err(format!("{member} in breakout room {} but not in room", room.id));
                    }
                    Some(Scope::Breakout(id)) if id == &room.id => {}
                    Some(other) => {
                        return Err(format!(
                            "{member} listed in breakout room {} but scoped to {other}",
                            room.id
                        ));
                    }
                }
            }
        }

        if let Some(host) = &self.host {
            if !self.roster.contains(host) {
                return Err(format!("host {host} is not in the room"));
            }
        }
        Ok(())
    }
}
