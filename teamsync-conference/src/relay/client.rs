use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{BreakoutOutcome, DeliveryReport, SignalingRelay};
use crate::error::{Error, Result};
use crate::protocol::{BreakoutCommand, MembershipSnapshot, NegotiationPayload, ScopeEvent, SignalMessage};
use crate::room::{Outbox, ParticipantInfo};
use crate::types::{ParticipantId, RoomId};

/// Relay handle injected into a session participant.
///
/// Inbound messages arrive on the receiver handed out when the client is
/// created, in the order the relay sent them.
#[async_trait]
pub trait RelayClient: Send + Sync {
    fn participant_id(&self) -> &ParticipantId;

    async fn join(&self, room_id: RoomId, info: ParticipantInfo) -> Result<MembershipSnapshot>;

    async fn leave(&self) -> Result<()>;

    async fn signal(
        &self,
        target: &ParticipantId,
        payload: NegotiationPayload,
    ) -> Result<DeliveryReport>;

    async fn publish(&self, event: ScopeEvent) -> Result<DeliveryReport>;

    async fn breakout(&self, command: BreakoutCommand) -> Result<BreakoutOutcome>;
}

/// In-process client over a shared [`SignalingRelay`]
pub struct LocalRelayClient {
    relay: Arc<SignalingRelay>,
    participant_id: ParticipantId,
    outbox: Outbox,
    room: Mutex<Option<RoomId>>,
}

impl LocalRelayClient {
    #[must_use]
    pub fn connect(
        relay: Arc<SignalingRelay>,
        participant_id: ParticipantId,
    ) -> (Self, mpsc::UnboundedReceiver<SignalMessage>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let client = Self {
            relay,
            participant_id,
            outbox,
            room: Mutex::new(None),
        };
        (client, inbox)
    }

    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.room.lock().clone()
    }

    fn joined_room(&self) -> Result<RoomId> {
        self.room_id()
            .ok_or_else(|| Error::InvalidState(format!("{} has not joined a room", self.participant_id)))
    }
}

#[async_trait]
impl RelayClient for LocalRelayClient {
    fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    async fn join(&self, room_id: RoomId, info: ParticipantInfo) -> Result<MembershipSnapshot> {
        if info.id != self.participant_id {
            return Err(Error::InvalidInput(format!(
                "client for {} cannot join as {}",
                self.participant_id, info.id
            )));
        }
        let snapshot = self.relay.join(room_id.clone(), info, self.outbox.clone())?;
        *self.room.lock() = Some(room_id);
        Ok(snapshot)
    }

    async fn leave(&self) -> Result<()> {
        let room_id = self.joined_room()?;
        self.relay.leave(&room_id, &self.participant_id)?;
        *self.room.lock() = None;
        Ok(())
    }

    async fn signal(
        &self,
        target: &ParticipantId,
        payload: NegotiationPayload,
    ) -> Result<DeliveryReport> {
        self.relay.signal(&self.participant_id, target, payload)
    }

    async fn publish(&self, event: ScopeEvent) -> Result<DeliveryReport> {
        self.relay.publish(&self.participant_id, event)
    }

    async fn breakout(&self, command: BreakoutCommand) -> Result<BreakoutOutcome> {
        let room_id = self.joined_room()?;
        self.relay.breakout(&room_id, &self.participant_id, command)
    }
}

impl Drop for LocalRelayClient {
    fn drop(&mut self) {
        if self.room.get_mut().is_some() {
            self.relay.disconnect(&self.participant_id);
        }
    }
}
