//! Breakout room coordination
//!
//! Per-room state machine `MainOnly → RoomsDefined → RoomsActive → Closing →
//! MainOnly`. Every scope move goes through [`BreakoutRoomCoordinator::relocate`],
//! the only place that writes roster scopes and breakout member sets.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::{Assignment, BreakoutRoomInfo, BreakoutState};
use crate::room::Roster;
use crate::types::{BreakoutRoomId, ParticipantId, RoomId, Scope};

/// A host-defined sub-scope of a room
#[derive(Debug, Clone)]
pub struct BreakoutRoom {
    pub id: BreakoutRoomId,
    pub name: String,
    pub parent: RoomId,
    pub participants: BTreeSet<ParticipantId>,
    pub open: bool,
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl BreakoutRoom {
    #[must_use]
    pub fn info(&self) -> BreakoutRoomInfo {
        BreakoutRoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            parent_room_id: self.parent.clone(),
            participants: self.participants.iter().cloned().collect(),
            open: self.open,
        }
    }
}

/// One participant moving between scopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeChange {
    pub participant_id: ParticipantId,
    pub from: Scope,
    pub to: Scope,
}

#[derive(Debug)]
pub struct BreakoutRoomCoordinator {
    parent: RoomId,
    state: BreakoutState,
    rooms: HashMap<BreakoutRoomId, BreakoutRoom>,
    /// Host assignment table; decides where a non-host may self-join
    assignments: HashMap<ParticipantId, BreakoutRoomId>,
    next_seq: u64,
    max_rooms: usize,
    max_name_len: usize,
}

impl BreakoutRoomCoordinator {
    #[must_use]
    pub fn new(parent: RoomId, config: &RelayConfig) -> Self {
        Self {
            parent,
            state: BreakoutState::MainOnly,
            rooms: HashMap::new(),
            assignments: HashMap::new(),
            next_seq: 0,
            max_rooms: config.max_breakout_rooms,
            max_name_len: config.max_name_len,
        }
    }

    #[must_use]
    pub const fn state(&self) -> BreakoutState {
        self.state
    }

    #[must_use]
    pub fn room(&self, id: &BreakoutRoomId) -> Option<&BreakoutRoom> {
        self.rooms.get(id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &BreakoutRoom> {
        self.rooms.values()
    }

    #[must_use]
    pub fn assignment(&self, participant: &ParticipantId) -> Option<&BreakoutRoomId> {
        self.assignments.get(participant)
    }

    /// Room list in creation order
    #[must_use]
    pub fn rooms_info(&self) -> Vec<BreakoutRoomInfo> {
        let mut rooms: Vec<&BreakoutRoom> = self.rooms.values().collect();
        rooms.sort_by_key(|r| r.seq);
        rooms.into_iter().map(BreakoutRoom::info).collect()
    }

    pub fn create_room(&mut self, name: &str) -> Result<&BreakoutRoom> {
        if !matches!(
            self.state,
            BreakoutState::MainOnly | BreakoutState::RoomsDefined
        ) {
            return Err(Error::InvalidState(format!(
                "cannot create breakout rooms while {:?}",
                self.state
            )));
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("breakout room name is empty".into()));
        }
        if name.chars().count() > self.max_name_len {
            return Err(Error::InvalidInput(format!(
                "breakout room name longer than {} characters",
                self.max_name_len
            )));
        }
        if self.rooms.values().any(|r| r.open && r.name == name) {
            return Err(Error::AlreadyExists(format!("breakout room {name:?}")));
        }
        if self.max_rooms > 0 && self.rooms.len() >= self.max_rooms {
            return Err(Error::CapacityExceeded(format!(
                "room {} already has {} breakout rooms",
                self.parent, self.max_rooms
            )));
        }

        let id = BreakoutRoomId::generate();
        let room = BreakoutRoom {
            id: id.clone(),
            name: name.to_string(),
            parent: self.parent.clone(),
            participants: BTreeSet::new(),
            open: true,
            created_at: Utc::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.state = BreakoutState::RoomsDefined;

        debug!(room_id = %self.parent, breakout_room_id = %id, name = %room.name, "Breakout room created");
        let room = self.rooms.entry(id).or_insert(room);
        Ok(&*room)
    }

    /// Apply an assignment table. Targets are validated up front so the table
    /// is applied entirely or not at all; entries naming participants that
    /// are no longer in the room are dropped.
    pub fn assign(
        &mut self,
        roster: &mut Roster,
        assignments: &[Assignment],
    ) -> Result<Vec<ScopeChange>> {
        if self.state == BreakoutState::Closing {
            return Err(Error::InvalidState("breakout rooms are closing".into()));
        }

        let resolved = assignments
            .iter()
            .map(|a| Ok((&a.participant_id, self.resolve_target(&a.room_id)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut changes = Vec::new();
        for (participant, target) in resolved {
            if !roster.contains(participant) {
                debug!(room_id = %self.parent, participant_id = %participant, "Dropping assignment for absent participant");
                continue;
            }
            match target.breakout_room() {
                Some(room_id) => {
                    self.assignments.insert(participant.clone(), room_id.clone());
                }
                None => {
                    self.assignments.remove(participant);
                }
            }
            changes.extend(self.relocate(roster, participant, target));
        }

        if !self.assignments.is_empty() {
            self.state = BreakoutState::RoomsActive;
        }
        Ok(changes)
    }

    /// Move one participant into an open breakout room. Hosts may enter any
    /// room; everyone else only the room they were assigned to.
    pub fn join_room(
        &mut self,
        roster: &mut Roster,
        participant: &ParticipantId,
        is_host: bool,
        room_id: &BreakoutRoomId,
    ) -> Result<Option<ScopeChange>> {
        if !self.rooms.get(room_id).is_some_and(|r| r.open) {
            return Err(Error::NotFound(format!("breakout room {room_id}")));
        }
        if !is_host && self.assignments.get(participant) != Some(room_id) {
            return Err(Error::PermissionDenied(format!(
                "{participant} is not assigned to breakout room {room_id}"
            )));
        }

        let change = self.relocate(roster, participant, Scope::Breakout(room_id.clone()));
        if change.is_some() && self.state == BreakoutState::RoomsDefined {
            self.state = BreakoutState::RoomsActive;
        }
        Ok(change)
    }

    pub fn return_to_main(
        &mut self,
        roster: &mut Roster,
        participant: &ParticipantId,
    ) -> Option<ScopeChange> {
        self.relocate(roster, participant, Scope::Main)
    }

    /// Members of every open breakout room
    pub fn broadcast_recipients(&self, roster: &Roster) -> Result<Vec<ParticipantId>> {
        if self.rooms.is_empty() {
            return Err(Error::InvalidState("no breakout rooms to broadcast to".into()));
        }
        let mut recipients: Vec<ParticipantId> = self
            .rooms
            .values()
            .filter(|r| r.open)
            .flat_map(|r| r.participants.iter())
            .filter(|id| roster.contains(id))
            .cloned()
            .collect();
        recipients.sort();
        Ok(recipients)
    }

    /// Close one room, moving all of its members back to the main scope
    /// before the room disappears.
    pub fn close_room(
        &mut self,
        roster: &mut Roster,
        room_id: &BreakoutRoomId,
    ) -> Result<Vec<ScopeChange>> {
        if !self.rooms.contains_key(room_id) {
            return Err(Error::NotFound(format!("breakout room {room_id}")));
        }

        let previous = self.state;
        self.state = BreakoutState::Closing;
        let changes = self.close_one(roster, room_id);
        self.state = if self.rooms.is_empty() {
            BreakoutState::MainOnly
        } else {
            previous
        };
        Ok(changes)
    }

    pub fn close_all(&mut self, roster: &mut Roster) -> Vec<ScopeChange> {
        self.state = BreakoutState::Closing;

        let mut ids: Vec<(u64, BreakoutRoomId)> =
            self.rooms.values().map(|r| (r.seq, r.id.clone())).collect();
        ids.sort();

        let mut changes = Vec::new();
        for (_, id) in ids {
            changes.extend(self.close_one(roster, &id));
        }
        self.assignments.clear();
        self.state = BreakoutState::MainOnly;
        changes
    }

    /// Drop a departing participant from member sets and the assignment table
    pub fn forget(&mut self, participant: &ParticipantId) {
        for room in self.rooms.values_mut() {
            room.participants.remove(participant);
        }
        self.assignments.remove(participant);
    }

    fn close_one(&mut self, roster: &mut Roster, room_id: &BreakoutRoomId) -> Vec<ScopeChange> {
        let members: Vec<ParticipantId> = match self.rooms.get_mut(room_id) {
            Some(room) => {
                room.open = false;
                room.participants.iter().cloned().collect()
            }
            None => return Vec::new(),
        };

        let changes: Vec<ScopeChange> = members
            .iter()
            .filter_map(|id| self.relocate(roster, id, Scope::Main))
            .collect();

        self.rooms.remove(room_id);
        self.assignments.retain(|_, assigned| assigned != room_id);
        debug!(
            room_id = %self.parent,
            breakout_room_id = %room_id,
            returned = changes.len(),
            "Breakout room closed"
        );
        changes
    }

    fn resolve_target(&self, target: &str) -> Result<Scope> {
        if target == self.parent.as_str() {
            return Ok(Scope::Main);
        }
        let id = BreakoutRoomId::from(target);
        match self.rooms.get(&id) {
            Some(room) if room.open => Ok(Scope::Breakout(id)),
            _ => Err(Error::NotFound(format!("breakout room {target}"))),
        }
    }

    fn relocate(
        &mut self,
        roster: &mut Roster,
        participant: &ParticipantId,
        to: Scope,
    ) -> Option<ScopeChange> {
        let from = roster.scope_of(participant)?.clone();
        if from == to {
            return None;
        }
        if let Scope::Breakout(target) = &to {
            self.rooms.get_mut(target)?.participants.insert(participant.clone());
        }
        if let Scope::Breakout(previous) = &from {
            if let Some(room) = self.rooms.get_mut(previous) {
                room.participants.remove(participant);
            }
        }
        roster.set_scope(participant, to.clone());

        Some(ScopeChange {
            participant_id: participant.clone(),
            from,
            to,
        })
    }
}
