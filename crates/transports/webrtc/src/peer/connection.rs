//! WebRTC peer connection driving one side of a CamLink call

use crate::config::MediaOptions;
use async_trait::async_trait;
use camlink_core::config::IceConfig;
use camlink_core::{
    Error, IceCandidate, MediaConnectionState, MediaEngine, MediaEvent, RemoteTrackInfo, Result,
    Role, SdpKind, SessionDescription,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// [`MediaEngine`] backed by a webrtc-rs `RTCPeerConnection`
///
/// The camera side sends a VP8 video track (plus Opus audio when enabled);
/// the viewer side receives. Media events are queued on an unbounded channel
/// that the signaling engine takes once per call.
pub struct WebRtcMediaEngine {
    role: Role,
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    state: Arc<Mutex<MediaConnectionState>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
    video_track: Option<Arc<TrackLocalStaticSample>>,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
    closed: AtomicBool,
}

impl WebRtcMediaEngine {
    /// Create a peer connection for `role`
    #[instrument(skip(ice, options), fields(role = %role))]
    pub async fn new(role: Role, ice: &IceConfig, options: MediaOptions) -> Result<Self> {
        ice.validate()?;

        let connection_id = uuid::Uuid::new_v4().to_string();
        info!("Creating peer connection: connection_id={}", connection_id);

        // Opus for audio, VP8/VP9/H.264 for video
        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| Error::MediaError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut codecs)
            .map_err(|e| Error::MediaError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::MediaError(format!("Failed to create peer connection: {}", e))
        })?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MediaConnectionState::New));
        let remote_tracks = Arc::new(Mutex::new(Vec::new()));

        install_handlers(
            &peer_connection,
            events_tx,
            Arc::clone(&state),
            Arc::clone(&remote_tracks),
        );

        let mut engine = Self {
            role,
            connection_id,
            peer_connection,
            state,
            events_rx: Mutex::new(Some(events_rx)),
            video_track: None,
            audio_track: None,
            senders: Mutex::new(Vec::new()),
            remote_tracks,
            closed: AtomicBool::new(false),
        };

        match role {
            Role::Offerer => engine.add_local_tracks(&options).await?,
            Role::Answerer => engine.add_receive_transceivers().await?,
        }

        Ok(engine)
    }

    async fn add_local_tracks(&mut self, options: &MediaOptions) -> Result<()> {
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: options.video_mime_type.clone(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{}-{}", options.facing, self.connection_id),
            format!("camlink-{}", self.connection_id),
        ));
        self.add_sender(Arc::clone(&video)).await?;
        self.video_track = Some(video);

        if options.enable_audio {
            let audio = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: options.audio_sample_rate,
                    channels: options.audio_channels,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                format!("audio-{}", self.connection_id),
                format!("camlink-{}", self.connection_id),
            ));
            self.add_sender(Arc::clone(&audio)).await?;
            self.audio_track = Some(audio);
        }

        debug!(
            "Local tracks added: video=true ({} camera) audio={}",
            options.facing,
            self.audio_track.is_some()
        );
        Ok(())
    }

    async fn add_sender(&self, track: Arc<TrackLocalStaticSample>) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaError(format!("Failed to add track: {}", e)))?;
        self.senders.lock().push(sender);
        Ok(())
    }

    async fn add_receive_transceivers(&self) -> Result<()> {
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    Error::MediaError(format!("Failed to add {} transceiver: {}", kind, e))
                })?;
        }
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Latest state reported by the peer connection
    pub fn connection_state(&self) -> MediaConnectionState {
        *self.state.lock()
    }

    /// Outbound video track; capture pipelines write samples here
    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video_track.clone()
    }

    /// Outbound audio track, if audio is enabled
    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.audio_track.clone()
    }

    /// Inbound tracks received so far
    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.remote_tracks.lock().clone()
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::MediaError("Peer connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn create_local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        self.ensure_open()?;

        let description = match kind {
            SdpKind::Offer => self.peer_connection.create_offer(None).await,
            SdpKind::Answer => self.peer_connection.create_answer(None).await,
        }
        .map_err(|e| Error::MediaError(format!("Failed to create {}: {}", kind.as_str(), e)))?;

        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::MediaError(format!("Failed to set local description: {}", e)))?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::MediaError(format!("No local description after setting {}", kind.as_str()))
            })?;

        debug!("Created local {} ({} bytes)", kind.as_str(), local.sdp.len());

        Ok(SessionDescription {
            kind,
            sdp: local.sdp,
        })
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;

        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| {
            Error::IncompatibleDescription(format!(
                "Failed to parse {}: {}",
                description.kind.as_str(),
                e
            ))
        })?;

        self.peer_connection
            .set_remote_description(parsed)
            .await
            .map_err(|e| {
                Error::IncompatibleDescription(format!("Failed to set remote description: {}", e))
            })?;

        debug!("Applied remote {}", description.kind.as_str());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;

        if self.peer_connection.remote_description().await.is_none() {
            return Err(Error::InvalidCandidate(
                "No remote description applied".to_string(),
            ));
        }

        debug!("Adding remote candidate: {}", candidate.candidate);

        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| Error::InvalidCandidate(format!("Failed to add ICE candidate: {}", e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.lock().take()
    }

    async fn stop_local_media(&self) -> Result<()> {
        let senders: Vec<_> = self.senders.lock().drain(..).collect();
        if senders.is_empty() {
            return Ok(());
        }

        let mut result = Ok(());
        for sender in senders {
            if let Err(e) = self.peer_connection.remove_track(&sender).await {
                warn!("Failed to remove local track: {}", e);
                result = Err(Error::MediaError(format!(
                    "Failed to remove local track: {}",
                    e
                )));
            }
        }

        info!("Stopped local media for connection {}", self.connection_id);
        result
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing peer connection {}", self.connection_id);

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::MediaError(format!("Failed to close connection: {}", e)))
    }
}

fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    ice.stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(ice.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect()
}

fn install_handlers(
    peer_connection: &RTCPeerConnection,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    state: Arc<Mutex<MediaConnectionState>>,
    remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
) {
    let tx = events_tx.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let event = match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => MediaEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => {
                        warn!("Failed to serialize local ICE candidate: {}", e);
                        return;
                    }
                },
                None => {
                    debug!("ICE gathering complete");
                    MediaEvent::CandidateGatheringComplete
                }
            };
            let _ = tx.send(event);
        })
    }));

    let tx = events_tx.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            let state = Arc::clone(&state);
            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => MediaConnectionState::New,
                    RTCPeerConnectionState::Connecting => MediaConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => MediaConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => MediaConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => MediaConnectionState::Failed,
                    RTCPeerConnectionState::Closed => MediaConnectionState::Closed,
                    _ => return,
                };

                let old_state = std::mem::replace(&mut *state.lock(), new_state);
                if old_state != new_state {
                    debug!(
                        "Peer connection state transition: {:?} -> {:?}",
                        old_state, new_state
                    );
                    let _ = tx.send(MediaEvent::ConnectionStateChanged(new_state));
                }
            })
        },
    ));

    let tx = events_tx;
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = tx.clone();
            let remote_tracks = Arc::clone(&remote_tracks);
            Box::pin(async move {
                let info = RemoteTrackInfo {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind: match track.kind() {
                        RTPCodecType::Audio => "audio",
                        RTPCodecType::Video => "video",
                        _ => "unspecified",
                    }
                    .to_string(),
                };
                info!("Remote {} track received: {}", info.kind, info.track_id);
                remote_tracks.lock().push(track);
                let _ = tx.send(MediaEvent::RemoteTrack(info));
            })
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_core::CameraFacing;

    fn local_ice() -> IceConfig {
        // Host candidates only; no network round trips
        IceConfig {
            stun_servers: vec!["stun:127.0.0.1:3478".to_string()],
            turn_servers: Vec::new(),
        }
    }

    async fn camera(enable_audio: bool) -> WebRtcMediaEngine {
        let options = MediaOptions {
            enable_audio,
            ..Default::default()
        };
        WebRtcMediaEngine::new(Role::Offerer, &local_ice(), options)
            .await
            .unwrap()
    }

    async fn viewer() -> WebRtcMediaEngine {
        WebRtcMediaEngine::new(Role::Answerer, &local_ice(), MediaOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_contains_media_sections() {
        let engine = camera(true).await;
        assert!(engine.video_track().is_some());
        assert!(engine.audio_track().is_some());

        let offer = engine
            .create_local_description(SdpKind::Offer)
            .await
            .unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=audio"));

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_video_track_id_carries_facing() {
        let options = MediaOptions {
            enable_audio: false,
            facing: CameraFacing::User,
            ..Default::default()
        };
        let engine = WebRtcMediaEngine::new(Role::Offerer, &local_ice(), options)
            .await
            .unwrap();

        let track = engine.video_track().unwrap();
        assert!(track.id().starts_with("video-user-"));

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_video_only_offer() {
        let engine = camera(false).await;
        assert!(engine.audio_track().is_none());

        let offer = engine
            .create_local_description(SdpKind::Offer)
            .await
            .unwrap();
        assert!(offer.sdp.contains("m=video"));
        assert!(!offer.sdp.contains("m=audio"));

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_description_is_incompatible() {
        let engine = viewer().await;
        let err = engine
            .apply_remote_description(SessionDescription::offer("not an sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleDescription(_)));
        assert!(err.is_fatal());

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_description_is_invalid() {
        let engine = viewer().await;
        let err = engine
            .add_remote_candidate(IceCandidate::new(
                "candidate:1 1 udp 2130706431 192.168.1.20 54321 typ host",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCandidate(_)));

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_after_offer() {
        let camera = camera(true).await;
        let viewer = viewer().await;

        let offer = camera
            .create_local_description(SdpKind::Offer)
            .await
            .unwrap();
        viewer.apply_remote_description(offer).await.unwrap();

        let answer = viewer
            .create_local_description(SdpKind::Answer)
            .await
            .unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(answer.sdp.contains("m=video"));

        camera.apply_remote_description(answer).await.unwrap();

        camera.close().await.unwrap();
        viewer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_without_offer_fails() {
        let engine = viewer().await;
        let err = engine
            .create_local_description(SdpKind::Answer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaError(_)));

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let engine = viewer().await;
        assert!(engine.take_events().is_some());
        assert!(engine.take_events().is_none());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let engine = camera(false).await;
        engine.stop_local_media().await.unwrap();
        engine.stop_local_media().await.unwrap();
        engine.close().await.unwrap();
        engine.close().await.unwrap();

        let err = engine
            .create_local_description(SdpKind::Offer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaError(_)));
    }

    #[tokio::test]
    async fn test_local_candidates_reported() {
        let engine = camera(false).await;
        let mut events = engine.take_events().unwrap();
        engine
            .create_local_description(SdpKind::Offer)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        let mut complete = false;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
            if let MediaEvent::CandidateGatheringComplete = event {
                complete = true;
                break;
            }
        }
        assert!(complete);

        engine.close().await.unwrap();
    }
}
