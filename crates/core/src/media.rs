//! Media engine interface
//!
//! The signaling engine never touches media. It configures an external
//! real-time media engine (a WebRTC peer connection in practice) through this
//! trait and listens to the events the engine raises.

use crate::codec::{IceCandidate, SdpKind, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Connection state reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Metadata for an inbound media track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    /// `audio` or `video`
    pub kind: String,
}

/// Events raised by the media engine
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// A local network path was discovered and should be sent to the peer
    LocalCandidate(IceCandidate),
    /// Local candidate gathering finished
    CandidateGatheringComplete,
    /// Inbound media arrived from the peer
    RemoteTrack(RemoteTrackInfo),
    ConnectionStateChanged(MediaConnectionState),
}

impl MediaEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MediaEvent::LocalCandidate(_) => "local_candidate",
            MediaEvent::CandidateGatheringComplete => "candidate_gathering_complete",
            MediaEvent::RemoteTrack(_) => "remote_track",
            MediaEvent::ConnectionStateChanged(_) => "connection_state_changed",
        }
    }
}

/// Real-time media engine driven by the signaling engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create and install the local description of the given kind
    ///
    /// An answer can only be created after the peer's offer was applied.
    async fn create_local_description(&self, kind: SdpKind) -> Result<SessionDescription>;

    /// Apply the peer's description; fails with `IncompatibleDescription`
    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Add one peer candidate; fails with `InvalidCandidate`, including when
    /// no remote description has been applied yet
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Take the event receiver; `None` if it was already taken
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>>;

    /// Stop forwarding local media to the peer
    async fn stop_local_media(&self) -> Result<()>;

    /// Close the connection; later calls are no-ops
    async fn close(&self) -> Result<()>;
}
