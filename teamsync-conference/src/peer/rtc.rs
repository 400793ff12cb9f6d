use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};

use super::link::{IceCandidate, InboundSink, LinkFactory, MediaLink, ReplaceOutcome};
use crate::config::ConferenceConfig;
use crate::error::{Error, Result};
use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{PairKey, TrackKind};

/// Builds [`RtcLink`]s sharing one media engine and interceptor registry
pub struct RtcLinkFactory {
    api: API,
    stun_servers: Vec<String>,
}

impl RtcLinkFactory {
    pub fn new(config: &ConferenceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            stun_servers: config.stun_servers.clone(),
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn create(&self, key: &PairKey, inbound: InboundSink) -> Result<Box<dyn MediaLink>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);

        let label = key.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!(link = %label, %state, "Peer connection state changed");
            Box::pin(async {})
        }));

        let label = key.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let inbound = inbound.clone();
            let label = label.clone();
            Box::pin(async move {
                let Some(track) = RemoteTrack::from_rtc(track) else {
                    return;
                };
                debug!(link = %label, kind = %track.kind(), track_id = track.id(), "Remote track");
                let _ = inbound.send(track);
            })
        }));

        Ok(Box::new(RtcLink {
            key: key.clone(),
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// [`MediaLink`] over a `webrtc` peer connection.
///
/// ICE is gathered up front: SDP handed out already carries every local
/// candidate, so no trickle candidates are sent. Offers always carry one
/// audio and one video section, so tracks the answering side adds later ride
/// on sections that already exist.
pub struct RtcLink {
    key: PairKey,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

const fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

impl RtcLink {
    /// Add a receive-only transceiver for every kind that has none yet
    async fn ensure_media_sections(&self) -> Result<()> {
        let transceivers = self.pc.get_transceivers().await;
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if transceivers.iter().any(|t| t.kind() == codec_type(kind)) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    codec_type(kind),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// A transceiver of `kind` whose sender has no track
    async fn idle_transceiver(&self, kind: TrackKind) -> Option<Arc<RTCRtpTransceiver>> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() != codec_type(kind) {
                continue;
            }
            if transceiver.sender().await.track().await.is_none() {
                return Some(transceiver);
            }
        }
        None
    }

    async fn set_local_and_gather(&self, description: RTCSessionDescription) -> Result<String> {
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(description).await?;
        let _ = gathered.recv().await;

        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| Error::Negotiation(format!("no local description on {}", self.key)))
    }
}

#[async_trait]
impl MediaLink for RtcLink {
    async fn create_offer(&self) -> Result<String> {
        self.ensure_media_sections().await?;
        let offer = self.pc.create_offer(None).await?;
        self.set_local_and_gather(offer).await
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        self.pc
            .set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        let answer = self.pc.create_answer(None).await?;
        self.set_local_and_gather(answer).await
    }

    async fn accept_answer(&self, sdp: String) -> Result<()> {
        self.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn attach_track(&self, track: LocalTrack) -> Result<()> {
        let kind = track.kind();
        let sender = match self.idle_transceiver(kind).await {
            Some(transceiver) => {
                let sender = transceiver.sender().await;
                sender.replace_track(Some(track.rtc_track())).await?;
                transceiver
                    .set_direction(RTCRtpTransceiverDirection::Sendrecv)
                    .await;
                sender
            }
            None => self.pc.add_track(track.rtc_track()).await?,
        };

        // RTCP has to be drained for the interceptors to work
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(kind, sender);
        debug!(link = %self.key, %kind, track_id = %track.id(), "Track attached");
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<LocalTrack>) -> Result<ReplaceOutcome> {
        let sender = self.senders.lock().get(&kind).cloned();
        let Some(sender) = sender else {
            return Ok(ReplaceOutcome::NoSender);
        };
        sender
            .replace_track(track.as_ref().map(LocalTrack::rtc_track))
            .await?;
        Ok(ReplaceOutcome::Replaced)
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}
