use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::manager::{LinkState, PeerConnectionManager};
use crate::error::{Error, Result};
use crate::media::{LocalTrack, RemoteTrack};
use crate::protocol::NegotiationPayload;
use crate::types::{PairKey, ParticipantId, TrackKind};

enum Command {
    Initiate,
    Remote(NegotiationPayload),
    Replace(TrackKind, Option<LocalTrack>),
}

/// Owner-side handle to a [`PeerConnectionManager`] running in its own task.
///
/// Commands are applied one at a time in send order. The link closes when the
/// handle is dropped, when [`PeerHandle::close`] is called, on a fatal
/// negotiation error, or when an offer stays unanswered past the timeout
/// (the first one or a later renegotiation).
pub struct PeerHandle {
    key: PairKey,
    remote: ParticipantId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    inbound: watch::Receiver<Vec<RemoteTrack>>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn spawn(manager: PeerConnectionManager, negotiation_timeout: Duration) -> Self {
        let key = manager.key().clone();
        let remote = manager.remote().clone();
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(manager.state());
        let (inbound_tx, inbound) = watch::channel(manager.inbound_tracks());
        let cancel = CancellationToken::new();

        let channels = Channels {
            commands: rx,
            state: state_tx,
            inbound: inbound_tx,
        };
        tokio::spawn(run(manager, channels, cancel.clone(), negotiation_timeout));

        Self {
            key,
            remote,
            commands,
            state,
            inbound,
            cancel,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &PairKey {
        &self.key
    }

    #[must_use]
    pub const fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Returns false once the link task has stopped
    pub fn initiate(&self) -> bool {
        self.commands.send(Command::Initiate).is_ok()
    }

    pub fn signal(&self, payload: NegotiationPayload) -> bool {
        self.commands.send(Command::Remote(payload)).is_ok()
    }

    pub fn replace_track(&self, kind: TrackKind, track: Option<LocalTrack>) -> bool {
        self.commands.send(Command::Replace(kind, track)).is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Tracks currently received from the remote side, audio first
    #[must_use]
    pub fn inbound_tracks(&self) -> Vec<RemoteTrack> {
        self.inbound.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_inbound(&self) -> watch::Receiver<Vec<RemoteTrack>> {
        self.inbound.clone()
    }

    /// Wait until the link reaches `target` or closes. Returns the state
    /// reached.
    pub async fn wait_for(&self, target: LinkState) -> LinkState {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == target || *s == LinkState::Closed)
            .await
            .map_or(LinkState::Closed, |s| *s)
    }

    pub async fn closed(&self) {
        self.wait_for(LinkState::Closed).await;
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn step(manager: &mut PeerConnectionManager, command: Command) -> Result<()> {
    match command {
        Command::Initiate => manager.initiate().await,
        Command::Remote(payload) => manager.accept_remote_signal(payload).await,
        Command::Replace(kind, track) => manager.replace_outbound_track(kind, track).await,
    }
}

struct Channels {
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<LinkState>,
    inbound: watch::Sender<Vec<RemoteTrack>>,
}

/// Next track reported by the link. Pending forever once the link stops
/// reporting.
async fn next_inbound(events: &mut Option<mpsc::UnboundedReceiver<RemoteTrack>>) -> RemoteTrack {
    if let Some(rx) = events {
        if let Some(track) = rx.recv().await {
            return track;
        }
        *events = None;
    }
    std::future::pending().await
}

async fn run(
    mut manager: PeerConnectionManager,
    channels: Channels,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let Channels {
        mut commands,
        state,
        inbound,
    } = channels;
    let mut inbound_events = manager.take_inbound_events();

    loop {
        let deadline = manager.negotiation_deadline(timeout);

        let command = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(link = %manager.key(), state = %manager.state(), "Negotiation stalled, closing link");
                break;
            }
            track = next_inbound(&mut inbound_events) => {
                if manager.add_inbound(track) {
                    inbound.send_replace(manager.inbound_tracks());
                }
                continue;
            }
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = tokio::time::timeout(timeout, step(&mut manager, command)) => {
                result.unwrap_or(Err(Error::NegotiationTimeout(timeout)))
            }
        };

        match result {
            Ok(()) => {}
            Err(Error::InvalidState(reason)) => {
                debug!(link = %manager.key(), %reason, "Ignored out-of-order command");
            }
            Err(e) => {
                warn!(link = %manager.key(), error = %e, "Peer link failed");
                break;
            }
        }

        let current = manager.state();
        state.send_if_modified(|s| {
            let changed = *s != current;
            *s = current;
            changed
        });
    }

    drop(commands);
    drop(inbound_events);
    if let Err(e) = manager.close().await {
        debug!(link = %manager.key(), error = %e, "Close failed");
    }
    inbound.send_replace(Vec::new());
    state.send_replace(LinkState::Closed);
}
