use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use super::track::{LocalTrack, TrackSource};

/// Hardware errors. Always recoverable: the feature falls back to "off".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("no {0} available")]
    NotFound(TrackSource),

    #[error("{0} is in use by another application")]
    InUse(TrackSource),

    #[error("permission to use the {0} was denied")]
    PermissionDenied(TrackSource),
}

impl DeviceError {
    #[must_use]
    pub const fn source_kind(&self) -> TrackSource {
        match self {
            Self::NotFound(s) | Self::InUse(s) | Self::PermissionDenied(s) => *s,
        }
    }
}

/// Access to local capture hardware
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, source: TrackSource) -> Result<LocalTrack, DeviceError>;
}

/// Device set producing sample-fed tracks the application writes encoded
/// media into.
///
/// Each source behaves like exclusive hardware: it can back only one live
/// track at a time, so a second acquire while a track is still live fails
/// with [`DeviceError::InUse`].
pub struct SampleDevices {
    stream_id: String,
    state: Mutex<DeviceState>,
}

#[derive(Default)]
struct DeviceState {
    live: HashMap<TrackSource, LocalTrack>,
    missing: HashSet<TrackSource>,
    denied: HashSet<TrackSource>,
}

impl SampleDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Make a source (un)available, as when a device is unplugged
    pub fn set_available(&self, source: TrackSource, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.missing.remove(&source);
        } else {
            state.missing.insert(source);
        }
    }

    pub fn set_denied(&self, source: TrackSource, denied: bool) {
        let mut state = self.state.lock();
        if denied {
            state.denied.insert(source);
        } else {
            state.denied.remove(&source);
        }
    }

    /// The live track currently holding `source`, if any
    #[must_use]
    pub fn holder(&self, source: TrackSource) -> Option<LocalTrack> {
        self.state
            .lock()
            .live
            .get(&source)
            .filter(|t| t.is_live())
            .cloned()
    }
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn acquire(&self, source: TrackSource) -> Result<LocalTrack, DeviceError> {
        let mut state = self.state.lock();
        if state.missing.contains(&source) {
            return Err(DeviceError::NotFound(source));
        }
        if state.denied.contains(&source) {
            return Err(DeviceError::PermissionDenied(source));
        }
        if state.live.get(&source).is_some_and(LocalTrack::is_live) {
            return Err(DeviceError::InUse(source));
        }

        let track = LocalTrack::new(source, self.stream_id.clone());
        state.live.insert(source, track.clone());
        debug!(source = %source, track_id = %track.id(), "Acquired local track");
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_source_is_exclusive_until_stopped() {
        let devices = SampleDevices::default();
        let first = devices.acquire(TrackSource::Camera).await.unwrap();
        assert_eq!(
            devices.acquire(TrackSource::Camera).await.unwrap_err(),
            DeviceError::InUse(TrackSource::Camera)
        );

        first.stop();
        let second = devices.acquire(TrackSource::Camera).await.unwrap();
        assert!(!second.same_as(&first));
    }

    #[tokio::test]
    async fn test_missing_and_denied_sources() {
        let devices = SampleDevices::default();
        devices.set_available(TrackSource::Microphone, false);
        devices.set_denied(TrackSource::Screen, true);

        assert_eq!(
            devices.acquire(TrackSource::Microphone).await.unwrap_err(),
            DeviceError::NotFound(TrackSource::Microphone)
        );
        assert_eq!(
            devices.acquire(TrackSource::Screen).await.unwrap_err(),
            DeviceError::PermissionDenied(TrackSource::Screen)
        );
        assert!(devices.acquire(TrackSource::Camera).await.is_ok());
    }
}
