use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::types::{TrackId, TrackKind};

/// Hardware or capture source behind a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    #[must_use]
    pub const fn kind(self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }

    fn codec(self) -> RTCRtpCodecCapability {
        match self.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Microphone => write!(f, "microphone"),
            Self::Camera => write!(f, "camera"),
            Self::Screen => write!(f, "screen"),
        }
    }
}

struct Inner {
    id: TrackId,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: CancellationToken,
}

/// Cloneable handle to one local outbound track.
///
/// A disabled track stays attached but sends nothing. A stopped track has
/// released its source and cannot be restarted. A track can also end on its
/// own (device unplugged, capture stopped from the OS); both paths fire
/// [`LocalTrack::ended`].
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<Inner>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: impl Into<String>) -> Self {
        let id = TrackId::generate();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            source.codec(),
            format!("{source}-{id}"),
            stream_id.into(),
        ));
        Self {
            inner: Arc::new(Inner {
                id,
                source,
                rtc,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                ended: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.inner.id
    }

    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Still producing media: neither stopped nor ended out-of-band
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.inner.ended.is_cancelled()
    }

    /// Release the source. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.ended.cancel();
    }

    /// Out-of-band end of the source, as reported by the capture layer
    pub fn end(&self) {
        self.inner.ended.cancel();
    }

    /// Resolves once the track has stopped or ended
    pub async fn ended(&self) {
        self.inner.ended.cancelled().await;
    }

    /// The `webrtc` track peer connections send from
    #[must_use]
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.inner.rtc) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Feed one encoded media sample. Dropped while disabled.
    pub async fn write_sample(&self, data: Vec<u8>, duration: Duration) -> Result<()> {
        if !self.is_live() {
            return Err(Error::InvalidState(format!("{} track {} has ended", self.source(), self.id())));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        let sample = Sample {
            data: data.into(),
            duration,
            ..Default::default()
        };
        self.inner.rtc.write_sample(&sample).await?;
        Ok(())
    }

    /// Whether both handles refer to the same track
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Media arriving from a remote participant over one peer link
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    stream_id: String,
    rtc: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    /// A track description with no connection behind it
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            rtc: None,
        }
    }

    /// Wrap a track announced by a peer connection. Data channels and
    /// unknown codec types yield `None`.
    #[must_use]
    pub fn from_rtc(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Video => TrackKind::Video,
            _ => return None,
        };
        Some(Self {
            id: track.id(),
            kind,
            stream_id: track.stream_id(),
            rtc: Some(track),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The `webrtc` track to read RTP packets from
    #[must_use]
    pub const fn rtc_track(&self) -> Option<&Arc<TrackRemote>> {
        self.rtc.as_ref()
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind && self.stream_id == other.stream_id
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_ends_track() {
        let track = LocalTrack::new(TrackSource::Camera, "local");
        assert!(track.is_live());
        assert_eq!(track.kind(), TrackKind::Video);

        track.stop();
        track.stop();
        assert!(track.is_stopped());
        assert!(!track.is_live());
    }

    #[test]
    fn test_out_of_band_end_is_not_a_stop() {
        let track = LocalTrack::new(TrackSource::Screen, "local");
        let clone = track.clone();
        clone.end();
        assert!(!track.is_live());
        assert!(!track.is_stopped());
        assert!(track.same_as(&clone));
    }

    #[tokio::test]
    async fn test_write_after_end_fails() {
        let track = LocalTrack::new(TrackSource::Microphone, "local");
        track.set_enabled(false);
        track
            .write_sample(vec![0; 4], Duration::from_millis(20))
            .await
            .unwrap();

        track.stop();
        track.ended().await;
        let err = track
            .write_sample(vec![0; 4], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_remote_tracks_compare_by_identity_fields() {
        let a = RemoteTrack::new("t1", TrackKind::Audio, "bob");
        assert_eq!(a, a.clone());
        assert_ne!(a, RemoteTrack::new("t1", TrackKind::Video, "bob"));
        assert!(a.rtc_track().is_none());
        assert_eq!(a.stream_id(), "bob");
    }
}
