use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use teamsync_conference::protocol::{ClientFrame, ClientRequest, SignalMessage};
use teamsync_conference::room::ParticipantInfo;
use teamsync_conference::{ParticipantId, SignalingRelay};

use crate::server::AppState;

/// Upgrade to the signaling socket. Clients send `join-room` first; every
/// other request is rejected until then.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.config.server.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<SignalingRelay>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {} message: {}", message.kind(), e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!("WebSocket send failed: {}", e);
                break;
            }
        }
    });

    let mut connection = Connection::new(relay, tx);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()),
            Ok(Message::Binary(_)) => {
                connection.reply(SignalMessage::error("binary frames are not supported"));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket receive failed: {}", e);
                break;
            }
        }
    }

    connection.close();
    writer.abort();
}

/// One socket's view of the relay
struct Connection {
    relay: Arc<SignalingRelay>,
    outbox: mpsc::UnboundedSender<SignalMessage>,
    participant: Option<ParticipantId>,
}

impl Connection {
    const fn new(relay: Arc<SignalingRelay>, outbox: mpsc::UnboundedSender<SignalMessage>) -> Self {
        Self {
            relay,
            outbox,
            participant: None,
        }
    }

    fn reply(&self, message: SignalMessage) {
        // The writer only stops once the socket is gone
        let _ = self.outbox.send(message);
    }

    fn handle_text(&mut self, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed client frame: {}", e);
                self.reply(SignalMessage::error(format!("malformed message: {e}")));
                return;
            }
        };

        match self.participant.clone() {
            Some(participant) => {
                if let Some(reply) = self.relay.dispatch(&participant, frame) {
                    self.reply(reply);
                }
                if self.relay.room_of(&participant).is_none() {
                    info!(participant_id = %participant, "Participant left over WebSocket");
                    self.participant = None;
                }
            }
            None => self.join(frame),
        }
    }

    fn join(&mut self, frame: ClientFrame) {
        let ClientFrame {
            request_id,
            request,
        } = frame;
        let ClientRequest::JoinRoom {
            room_id,
            participant_id,
            display_name,
            is_host,
            flags,
        } = request
        else {
            self.reply(SignalMessage::error("join a room first"));
            return;
        };

        let participant_id = participant_id.unwrap_or_else(ParticipantId::generate);
        let info = ParticipantInfo::new(participant_id.clone(), display_name)
            .with_host(is_host)
            .with_flags(flags);

        match self.relay.join(room_id.clone(), info, self.outbox.clone()) {
            Ok(_) => {
                info!(participant_id = %participant_id, room_id = %room_id, "WebSocket participant joined");
                self.participant = Some(participant_id);
                if request_id.is_some() {
                    self.reply(SignalMessage::ack_ok(request_id, None));
                }
            }
            Err(e) => {
                debug!(room_id = %room_id, error = %e, "Join rejected");
                self.reply(SignalMessage::ack_failed(request_id, e));
            }
        }
    }

    fn close(&mut self) {
        if let Some(participant) = self.participant.take() {
            self.relay.disconnect(&participant);
            info!(participant_id = %participant, "WebSocket participant disconnected");
        }
    }
}
