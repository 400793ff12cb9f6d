//! Signaling wire format
//!
//! Every frame is a JSON object tagged by `type` (kebab-case) with camelCase
//! fields. Requests travel participant → relay, [`SignalMessage`]s travel
//! relay → participant. Nothing here is ever persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BreakoutRoomId, MediaFlags, ParticipantId, RoomId, Scope};

/// Connection-negotiation payload carried by `signal` frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum NegotiationPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    /// The answering side needs a new sender and asks for a fresh offer
    Renegotiate,
}

impl NegotiationPayload {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Renegotiate => "renegotiate",
        }
    }
}

/// One row of a host "assign participants" action.
///
/// `room_id` is either a breakout room id or the main room id, the latter
/// meaning "stay in / return to the main room".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub participant_id: ParticipantId,
    pub room_id: String,
}

impl Assignment {
    pub fn new(participant_id: impl Into<ParticipantId>, room_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            room_id: room_id.into(),
        }
    }
}

/// Requests a participant sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    JoinRoom {
        room_id: RoomId,
        /// Reconnecting clients may pin their id; otherwise one is generated
        #[serde(default)]
        participant_id: Option<ParticipantId>,
        display_name: String,
        #[serde(default)]
        is_host: bool,
        #[serde(default)]
        flags: MediaFlags,
    },
    LeaveRoom,
    Signal {
        target_id: ParticipantId,
        payload: NegotiationPayload,
    },
    MicToggle {
        on: bool,
    },
    CameraToggle {
        on: bool,
    },
    ScreenShareStarted,
    ScreenShareStopped,
    ChatMessage {
        content: String,
    },
    CreateBreakoutRoom {
        main_room_id: RoomId,
        name: String,
    },
    AssignToBreakoutRooms {
        main_room_id: RoomId,
        assignments: Vec<Assignment>,
    },
    JoinBreakoutRoom {
        main_room_id: RoomId,
        breakout_room_id: BreakoutRoomId,
    },
    ReturnToMainRoom {
        main_room_id: RoomId,
    },
    CloseBreakoutRoom {
        main_room_id: RoomId,
        breakout_room_id: BreakoutRoomId,
    },
    CloseAll {
        main_room_id: RoomId,
    },
    BroadcastToBreakoutRooms {
        main_room_id: RoomId,
        message: String,
    },
}

impl ClientRequest {
    /// Split a breakout request into its room and command
    #[must_use]
    pub fn into_breakout(self) -> Option<(RoomId, BreakoutCommand)> {
        let pair = match self {
            Self::CreateBreakoutRoom { main_room_id, name } => {
                (main_room_id, BreakoutCommand::CreateRoom { name })
            }
            Self::AssignToBreakoutRooms {
                main_room_id,
                assignments,
            } => (main_room_id, BreakoutCommand::Assign { assignments }),
            Self::JoinBreakoutRoom {
                main_room_id,
                breakout_room_id,
            } => (main_room_id, BreakoutCommand::JoinRoom { breakout_room_id }),
            Self::ReturnToMainRoom { main_room_id } => (main_room_id, BreakoutCommand::ReturnToMain),
            Self::CloseBreakoutRoom {
                main_room_id,
                breakout_room_id,
            } => (main_room_id, BreakoutCommand::CloseRoom { breakout_room_id }),
            Self::CloseAll { main_room_id } => (main_room_id, BreakoutCommand::CloseAll),
            Self::BroadcastToBreakoutRooms {
                main_room_id,
                message,
            } => (main_room_id, BreakoutCommand::Broadcast { message }),
            _ => return None,
        };
        Some(pair)
    }

    /// Toggle and chat requests, published to the sender's scope
    #[must_use]
    pub fn into_scope_event(self) -> Option<ScopeEvent> {
        match self {
            Self::MicToggle { on } => Some(ScopeEvent::MicToggle { on }),
            Self::CameraToggle { on } => Some(ScopeEvent::CameraToggle { on }),
            Self::ScreenShareStarted => Some(ScopeEvent::ScreenShareStarted),
            Self::ScreenShareStopped => Some(ScopeEvent::ScreenShareStopped),
            Self::ChatMessage { content } => Some(ScopeEvent::Chat { content }),
            _ => None,
        }
    }
}

/// A request plus the optional correlation id echoed back in its `ack`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

impl ClientFrame {
    #[must_use]
    pub const fn new(request: ClientRequest) -> Self {
        Self {
            request_id: None,
            request,
        }
    }
}

/// Host-driven (or self-service) breakout room operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakoutCommand {
    CreateRoom { name: String },
    Assign { assignments: Vec<Assignment> },
    JoinRoom { breakout_room_id: BreakoutRoomId },
    ReturnToMain,
    CloseRoom { breakout_room_id: BreakoutRoomId },
    CloseAll,
    Broadcast { message: String },
}

impl BreakoutCommand {
    /// Whether only the room host may issue this command
    #[must_use]
    pub const fn requires_host(&self) -> bool {
        !matches!(self, Self::JoinRoom { .. } | Self::ReturnToMain)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create-breakout-room",
            Self::Assign { .. } => "assign-to-breakout-rooms",
            Self::JoinRoom { .. } => "join-breakout-room",
            Self::ReturnToMain => "return-to-main-room",
            Self::CloseRoom { .. } => "close-breakout-room",
            Self::CloseAll => "close-all",
            Self::Broadcast { .. } => "broadcast-to-breakout-rooms",
        }
    }
}

/// Push-only notifications published to the sender's current scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEvent {
    MicToggle { on: bool },
    CameraToggle { on: bool },
    ScreenShareStarted,
    ScreenShareStopped,
    Chat { content: String },
}

/// Addressing unit for relay sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Participant(ParticipantId),
    /// Every other participant sharing the sender's scope
    Scope,
}

/// Lifecycle of a room's breakout partitioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakoutState {
    MainOnly,
    RoomsDefined,
    RoomsActive,
    Closing,
}

/// Participant as seen by the other members of its scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub flags: MediaFlags,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakoutRoomInfo {
    pub id: BreakoutRoomId,
    pub name: String,
    pub parent_room_id: RoomId,
    pub participants: Vec<ParticipantId>,
    pub open: bool,
}

/// Reply to a join: the joiner's scope, its roster and the breakout layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipSnapshot {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub scope: Scope,
    pub host_id: Option<ParticipantId>,
    /// Other members of the joiner's scope
    pub roster: Vec<RosterEntry>,
    pub breakout_state: BreakoutState,
    pub breakout_rooms: Vec<BreakoutRoomInfo>,
}

/// Messages the relay delivers to a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    RoomJoined {
        snapshot: MembershipSnapshot,
    },
    UserJoined {
        participant_id: ParticipantId,
        display_name: String,
        flags: MediaFlags,
        is_host: bool,
    },
    UserLeft {
        participant_id: ParticipantId,
        display_name: String,
    },
    Signal {
        sender_id: ParticipantId,
        payload: NegotiationPayload,
    },
    MicToggle {
        participant_id: ParticipantId,
        on: bool,
    },
    CameraToggle {
        participant_id: ParticipantId,
        on: bool,
    },
    ScreenShareStarted {
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        participant_id: ParticipantId,
    },
    ChatMessage {
        sender_id: ParticipantId,
        sender_name: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    BreakoutRoomsUpdate {
        main_room_id: RoomId,
        state: BreakoutState,
        rooms: Vec<BreakoutRoomInfo>,
        /// Current host wherever they are; a host moving between scopes
        /// shows up as `user-left` in the scope they leave
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_id: Option<ParticipantId>,
    },
    /// The recipient was moved; `roster` lists the other members of its new scope
    ScopeChanged {
        scope: Scope,
        roster: Vec<RosterEntry>,
    },
    BreakoutBroadcast {
        sender_id: ParticipantId,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<BreakoutRoomId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

impl SignalMessage {
    #[must_use]
    pub const fn ack_ok(request_id: Option<String>, room_id: Option<BreakoutRoomId>) -> Self {
        Self::Ack {
            request_id,
            success: true,
            room_id,
            error: None,
        }
    }

    pub fn ack_failed(request_id: Option<String>, error: impl ToString) -> Self {
        Self::Ack {
            request_id,
            success: false,
            room_id: None,
            error: Some(error.to_string()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The `type` tag, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RoomJoined { .. } => "room-joined",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::Signal { .. } => "signal",
            Self::MicToggle { .. } => "mic-toggle",
            Self::CameraToggle { .. } => "camera-toggle",
            Self::ScreenShareStarted { .. } => "screen-share-started",
            Self::ScreenShareStopped { .. } => "screen-share-stopped",
            Self::ChatMessage { .. } => "chat-message",
            Self::BreakoutRoomsUpdate { .. } => "breakout-rooms-update",
            Self::ScopeChanged { .. } => "scope-changed",
            Self::BreakoutBroadcast { .. } => "breakout-broadcast",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_parsing() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"join-room","requestId":"r1","roomId":"standup","displayName":"Ada","isHost":true}"#,
        )
        .unwrap();

        assert_eq!(frame.request_id.as_deref(), Some("r1"));
        match frame.request {
            ClientRequest::JoinRoom {
                room_id,
                participant_id,
                display_name,
                is_host,
                flags,
            } => {
                assert_eq!(room_id, RoomId::from("standup"));
                assert!(participant_id.is_none());
                assert_eq!(display_name, "Ada");
                assert!(is_host);
                assert_eq!(flags, MediaFlags::default());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_assign_frame_into_breakout() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"assign-to-breakout-rooms","mainRoomId":"m","assignments":[{"participantId":"b","roomId":"team-a"}]}"#,
        )
        .unwrap();
        assert!(frame.request_id.is_none());

        let (room, command) = frame.request.into_breakout().unwrap();
        assert_eq!(room, RoomId::from("m"));
        assert_eq!(
            command,
            BreakoutCommand::Assign {
                assignments: vec![Assignment::new("b", "team-a")]
            }
        );
        assert!(command.requires_host());
    }

    #[test]
    fn test_signal_message_tags() {
        let msg = SignalMessage::Signal {
            sender_id: ParticipantId::from("a"),
            payload: NegotiationPayload::Offer { sdp: "v=0".into() },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "signal");
        assert_eq!(value["senderId"], "a");
        assert_eq!(value["payload"]["type"], "offer");
        assert_eq!(msg.kind(), "signal");
    }

    #[test]
    fn test_renegotiate_request_and_breakout_host_on_the_wire() {
        let value = serde_json::to_value(NegotiationPayload::Renegotiate).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "renegotiate" }));
        let parsed: NegotiationPayload = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.kind(), "renegotiate");

        let update = SignalMessage::BreakoutRoomsUpdate {
            main_room_id: RoomId::from("m"),
            state: BreakoutState::RoomsActive,
            rooms: Vec::new(),
            host_id: Some(ParticipantId::from("a")),
        };
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["hostId"], "a");
        let without_host: SignalMessage = serde_json::from_str(
            r#"{"type":"breakout-rooms-update","mainRoomId":"m","state":"main-only","rooms":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            without_host,
            SignalMessage::BreakoutRoomsUpdate { host_id: None, .. }
        ));
    }

    #[test]
    fn test_failed_ack_shape() {
        let value =
            serde_json::to_value(SignalMessage::ack_failed(Some("7".into()), "no such room")).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["requestId"], "7");
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "no such room");
        assert!(value.get("roomId").is_none());
    }

    #[test]
    fn test_toggle_request_into_scope_event() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"mic-toggle","on":false}"#).unwrap();
        assert_eq!(
            frame.request.into_scope_event(),
            Some(ScopeEvent::MicToggle { on: false })
        );
    }
}
