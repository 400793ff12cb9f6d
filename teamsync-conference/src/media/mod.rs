//! Local media: outbound tracks, capture devices and the track controller

mod controller;
mod devices;
mod track;

pub use controller::{MediaState, MediaTrackController, TrackFanout, VideoSource};
pub use devices::{DeviceError, MediaDevices, SampleDevices};
pub use track::{LocalTrack, RemoteTrack, TrackSource};
