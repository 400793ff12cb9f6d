use std::collections::HashMap;
use tracing::debug;

use super::handle::PeerHandle;
use super::manager::LinkState;
use crate::error::{Error, Result};
use crate::media::{LocalTrack, TrackFanout};
use crate::types::{PairKey, ParticipantId, TrackKind};

/// The local participant's peer links, at most one live link per pair
#[derive(Default)]
pub struct PeerArena {
    links: HashMap<PairKey, PeerHandle>,
}

impl PeerArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link. A closed link under the same key is replaced.
    pub fn insert(&mut self, handle: PeerHandle) -> Result<()> {
        if let Some(existing) = self.links.get(handle.key()) {
            if !existing.is_closed() {
                return Err(Error::AlreadyExists(format!("link {}", handle.key())));
            }
        }
        self.links.insert(handle.key().clone(), handle);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: &PairKey) -> Option<&PeerHandle> {
        self.links.get(key)
    }

    /// Link to `remote`, whatever the local side of the key is
    #[must_use]
    pub fn by_remote(&self, remote: &ParticipantId) -> Option<&PeerHandle> {
        self.links.values().find(|h| h.remote() == remote)
    }

    /// Remove and close the link
    pub fn remove(&mut self, key: &PairKey) -> bool {
        self.links.remove(key).is_some_and(|handle| {
            handle.close();
            true
        })
    }

    pub fn close_all(&mut self) {
        let count = self.links.len();
        for (_, handle) in self.links.drain() {
            handle.close();
        }
        if count > 0 {
            debug!(count, "Closed all peer links");
        }
    }

    /// Drop links that closed on their own
    pub fn prune_closed(&mut self) -> Vec<PairKey> {
        let closed: Vec<_> = self
            .links
            .iter()
            .filter(|(_, h)| h.is_closed())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &closed {
            self.links.remove(key);
        }
        closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    #[must_use]
    pub fn states(&self) -> HashMap<ParticipantId, LinkState> {
        self.links
            .values()
            .map(|h| (h.remote().clone(), h.state()))
            .collect()
    }

    pub fn handles(&self) -> impl Iterator<Item = &PeerHandle> {
        self.links.values()
    }
}

impl TrackFanout for PeerArena {
    fn replace_outbound(&self, kind: TrackKind, track: Option<LocalTrack>) -> usize {
        self.links
            .values()
            .filter(|h| !h.is_closed())
            .filter(|h| h.replace_track(kind, track.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::link::MockMediaLink;
    use crate::peer::manager::PeerConnectionManager;
    use crate::relay::RelayClient;
    use crate::test_helpers::RecordingRelay;
    use std::sync::Arc;
    use std::time::Duration;

    fn handle(remote: &str) -> PeerHandle {
        let relay: Arc<dyn RelayClient> = Arc::new(RecordingRelay::default());
        let mut link = MockMediaLink::new();
        link.expect_close().returning(|| Ok(()));
        let manager = PeerConnectionManager::new(
            ParticipantId::from("local"),
            ParticipantId::from(remote),
            Box::new(link),
            relay,
        )
        .unwrap();
        PeerHandle::spawn(manager, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_one_live_link_per_pair() {
        let mut arena = PeerArena::new();
        arena.insert(handle("a")).unwrap();
        assert!(matches!(
            arena.insert(handle("a")),
            Err(Error::AlreadyExists(_))
        ));

        let key = PairKey::new("local".into(), "a".into()).unwrap();
        arena.get(&key).unwrap().close();
        arena.get(&key).unwrap().closed().await;
        arena.insert(handle("a")).unwrap();
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.states()[&ParticipantId::from("a")], LinkState::Idle);
    }

    #[tokio::test]
    async fn test_fanout_skips_closed_links() {
        let mut arena = PeerArena::new();
        arena.insert(handle("a")).unwrap();
        arena.insert(handle("b")).unwrap();
        let closing = arena.by_remote(&"b".into()).unwrap();
        closing.close();
        closing.closed().await;

        assert_eq!(arena.replace_outbound(TrackKind::Video, None), 1);
        assert_eq!(arena.prune_closed().len(), 1);

        arena.close_all();
        assert!(arena.is_empty());
    }
}
