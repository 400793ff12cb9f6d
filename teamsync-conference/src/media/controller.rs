use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::devices::{DeviceError, MediaDevices};
use super::track::{LocalTrack, TrackSource};
use crate::error::{Error, Result};
use crate::types::TrackKind;

/// Where outbound track changes are pushed: every live peer link of the
/// local participant. Each link converges on its own.
pub trait TrackFanout {
    /// Returns how many links accepted the change
    fn replace_outbound(&self, kind: TrackKind, track: Option<LocalTrack>) -> usize;
}

/// Which local source feeds the outbound video slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub mic_on: bool,
    pub camera_on: bool,
    pub screen_sharing: bool,
    pub video_source: Option<VideoSource>,
}

/// Owner of the local participant's outbound tracks.
///
/// At most one of camera and screen feeds the outbound video slot. While
/// sharing, a camera that is on stays acquired locally but is not sent.
pub struct MediaTrackController {
    devices: Arc<dyn MediaDevices>,
    microphone: Option<LocalTrack>,
    camera: Option<LocalTrack>,
    screen: Option<LocalTrack>,
}

impl MediaTrackController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            microphone: None,
            camera: None,
            screen: None,
        }
    }

    /// Acquire the initial tracks. Failures leave that source off and are
    /// returned as notices.
    pub async fn start(&mut self, mic_on: bool, camera_on: bool) -> Vec<DeviceError> {
        let mut notices = Vec::new();
        match self.devices.acquire(TrackSource::Microphone).await {
            Ok(track) => {
                track.set_enabled(mic_on);
                self.microphone = Some(track);
            }
            Err(e) => notices.push(e),
        }
        if camera_on {
            match self.devices.acquire(TrackSource::Camera).await {
                Ok(track) => self.camera = Some(track),
                Err(e) => notices.push(e),
            }
        }
        notices
    }

    #[must_use]
    pub fn state(&self) -> MediaState {
        MediaState {
            mic_on: self.microphone.as_ref().is_some_and(LocalTrack::is_enabled),
            camera_on: self.camera.is_some(),
            screen_sharing: self.screen.is_some(),
            video_source: self.active_video_source(),
        }
    }

    #[must_use]
    pub const fn active_video_source(&self) -> Option<VideoSource> {
        if self.screen.is_some() {
            Some(VideoSource::Screen)
        } else if self.camera.is_some() {
            Some(VideoSource::Camera)
        } else {
            None
        }
    }

    /// Track currently feeding the outbound slot of `kind`
    #[must_use]
    pub fn outbound(&self, kind: TrackKind) -> Option<LocalTrack> {
        match kind {
            TrackKind::Audio => self.microphone.clone(),
            TrackKind::Video => self.screen.clone().or_else(|| self.camera.clone()),
        }
    }

    #[must_use]
    pub fn screen_track(&self) -> Option<LocalTrack> {
        self.screen.clone()
    }

    /// Enable or disable the microphone. The hardware track is kept; it is
    /// only acquired here when none exists yet.
    pub async fn set_mic(&mut self, on: bool, fanout: &dyn TrackFanout) -> Result<()> {
        match &self.microphone {
            Some(track) => track.set_enabled(on),
            None if on => {
                let track = self.devices.acquire(TrackSource::Microphone).await?;
                fanout.replace_outbound(TrackKind::Audio, Some(track.clone()));
                self.microphone = Some(track);
            }
            None => {}
        }
        debug!(on, "Microphone toggled");
        Ok(())
    }

    /// Camera off releases the hardware; camera on acquires a fresh track.
    pub async fn set_camera(&mut self, on: bool, fanout: &dyn TrackFanout) -> Result<()> {
        if on {
            if self.camera.as_ref().is_some_and(LocalTrack::is_live) {
                return Ok(());
            }
            if let Some(stale) = self.camera.take() {
                stale.stop();
            }
            let track = self.devices.acquire(TrackSource::Camera).await?;
            self.camera = Some(track.clone());
            if self.screen.is_none() {
                let links = fanout.replace_outbound(TrackKind::Video, Some(track));
                debug!(links, "Camera track sent");
            }
        } else if let Some(track) = self.camera.take() {
            track.stop();
            if self.screen.is_none() {
                fanout.replace_outbound(TrackKind::Video, None);
            }
        }
        info!(on, "Camera toggled");
        Ok(())
    }

    pub async fn start_screen_share(&mut self, fanout: &dyn TrackFanout) -> Result<()> {
        if self.screen.is_some() {
            return Err(Error::InvalidState("screen share already active".into()));
        }
        let track = self.devices.acquire(TrackSource::Screen).await?;
        self.screen = Some(track.clone());
        fanout.replace_outbound(TrackKind::Video, Some(track));
        info!("Screen share started");
        Ok(())
    }

    pub async fn stop_screen_share(&mut self, fanout: &dyn TrackFanout) -> Result<()> {
        self.finish_screen_share(fanout).await
    }

    /// Common end of a screen share, whether stopped explicitly or ended by
    /// the capture source. Restores the camera if it was on; when the camera
    /// can't be restored the camera ends up off and the error is returned.
    /// A no-op when no share is active.
    pub async fn finish_screen_share(&mut self, fanout: &dyn TrackFanout) -> Result<()> {
        let Some(screen) = self.screen.take() else {
            return Ok(());
        };
        screen.stop();
        info!("Screen share stopped");

        let Some(camera) = self.camera.take() else {
            fanout.replace_outbound(TrackKind::Video, None);
            return Ok(());
        };
        if camera.is_live() {
            fanout.replace_outbound(TrackKind::Video, Some(camera.clone()));
            self.camera = Some(camera);
            return Ok(());
        }

        camera.stop();
        match self.devices.acquire(TrackSource::Camera).await {
            Ok(track) => {
                fanout.replace_outbound(TrackKind::Video, Some(track.clone()));
                self.camera = Some(track);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Camera restore failed, leaving camera off");
                fanout.replace_outbound(TrackKind::Video, None);
                Err(Error::Hardware(e))
            }
        }
    }

    /// Stop every owned track
    pub fn shutdown(&mut self) {
        for track in [self.microphone.take(), self.camera.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
    }
}

impl Drop for MediaTrackController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::devices::SampleDevices;
    use crate::test_helpers::RecordingFanout;

    fn controller() -> (MediaTrackController, Arc<SampleDevices>) {
        let devices = Arc::new(SampleDevices::default());
        (MediaTrackController::new(devices.clone()), devices)
    }

    #[tokio::test]
    async fn test_mic_toggle_keeps_hardware_track() {
        let (mut media, _devices) = controller();
        let fanout = RecordingFanout::default();
        media.start(true, false).await;
        let original = media.outbound(TrackKind::Audio).unwrap();

        media.set_mic(false, &fanout).await.unwrap();
        media.set_mic(true, &fanout).await.unwrap();

        assert!(media.outbound(TrackKind::Audio).unwrap().same_as(&original));
        assert!(original.is_live());
        assert!(fanout.calls().is_empty());
        assert!(media.state().mic_on);
    }

    #[tokio::test]
    async fn test_camera_off_releases_device() {
        let (mut media, devices) = controller();
        let fanout = RecordingFanout::default();
        media.start(true, true).await;
        let first = media.outbound(TrackKind::Video).unwrap();

        media.set_camera(false, &fanout).await.unwrap();
        assert!(first.is_stopped());
        assert!(devices.holder(TrackSource::Camera).is_none());

        media.set_camera(true, &fanout).await.unwrap();
        let second = media.outbound(TrackKind::Video).unwrap();
        assert!(!second.same_as(&first));

        let calls = fanout.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (TrackKind::Video, None));
        assert_eq!(calls[1].1.as_ref(), Some(&second));
    }

    #[tokio::test]
    async fn test_screen_share_excludes_camera() {
        let (mut media, _devices) = controller();
        let fanout = RecordingFanout::default();
        media.start(true, true).await;
        let camera = media.outbound(TrackKind::Video).unwrap();

        media.start_screen_share(&fanout).await.unwrap();
        assert_eq!(media.active_video_source(), Some(VideoSource::Screen));
        assert!(camera.is_live());

        // Camera toggles while sharing never reach the links
        media.set_camera(false, &fanout).await.unwrap();
        media.set_camera(true, &fanout).await.unwrap();
        assert_eq!(fanout.calls().len(), 1);

        media.stop_screen_share(&fanout).await.unwrap();
        assert_eq!(media.active_video_source(), Some(VideoSource::Camera));
        let restored = fanout.calls().last().cloned().unwrap();
        assert_eq!(restored.0, TrackKind::Video);
        assert_eq!(restored.1, media.outbound(TrackKind::Video));
    }

    #[tokio::test]
    async fn test_out_of_band_end_converges_with_stop() {
        let (mut media, _devices) = controller();
        let fanout = RecordingFanout::default();
        media.start(true, false).await;
        media.start_screen_share(&fanout).await.unwrap();

        media.screen_track().unwrap().end();
        media.finish_screen_share(&fanout).await.unwrap();
        // A late explicit stop after the capture ended is a no-op
        media.stop_screen_share(&fanout).await.unwrap();

        assert_eq!(media.active_video_source(), None);
        assert_eq!(fanout.calls().last().cloned().unwrap(), (TrackKind::Video, None));
        assert_eq!(fanout.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_camera_restore_leaves_camera_off() {
        let (mut media, devices) = controller();
        let fanout = RecordingFanout::default();
        media.start(true, true).await;
        media.start_screen_share(&fanout).await.unwrap();

        // The camera drops out during the share and another app grabs it
        let retained = media.camera.clone().unwrap();
        retained.end();
        let _other_app = devices.acquire(TrackSource::Camera).await.unwrap();

        let err = media.stop_screen_share(&fanout).await.unwrap_err();
        assert!(matches!(err, Error::Hardware(DeviceError::InUse(TrackSource::Camera))));

        let state = media.state();
        assert!(!state.camera_on);
        assert!(!state.screen_sharing);
        assert_eq!(state.video_source, None);
    }

    #[tokio::test]
    async fn test_camera_unavailable_is_recoverable() {
        let (mut media, devices) = controller();
        devices.set_available(TrackSource::Camera, false);
        let fanout = RecordingFanout::default();

        let notices = media.start(true, true).await;
        assert_eq!(notices, vec![DeviceError::NotFound(TrackSource::Camera)]);

        let err = media.set_camera(true, &fanout).await.unwrap_err();
        assert!(matches!(err, Error::Hardware(_)));
        assert!(!media.state().camera_on);
        assert!(media.state().mic_on);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (mut media, _devices) = controller();
        let fanout = RecordingFanout::default();
        media.start(true, true).await;
        media.start_screen_share(&fanout).await.unwrap();
        let tracks: Vec<_> = [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .filter_map(|k| media.outbound(k))
            .collect();

        media.shutdown();

        assert!(tracks.iter().all(LocalTrack::is_stopped));
        assert_eq!(media.state().video_source, None);
    }
}
