//! Events delivered from a running call to its owner (UI, CLI)

use super::state::{Role, SignalingState};
use crate::code::SessionCode;
use crate::media::{MediaConnectionState, RemoteTrackInfo};
use crate::Error;

/// Event emitted by a [`CallSession`](super::CallSession)
#[derive(Debug)]
pub enum SessionEvent {
    /// The signaling state changed
    StateChanged {
        from: SignalingState,
        to: SignalingState,
    },

    /// The viewer is subscribed and waiting for the camera's offer
    WaitingForOffer,

    /// A non-fatal problem; the call keeps processing events
    ///
    /// Skipped malformed messages, the "no offer yet" notice, and failed
    /// candidate publishes arrive here.
    Notice(Error),

    /// A fatal problem; the call is being torn down
    Error(Error),

    /// Inbound media arrived from the peer
    RemoteTrack(RemoteTrackInfo),

    /// The media engine's connection state changed
    MediaStateChanged(MediaConnectionState),

    /// The call is fully torn down
    Closed,
}

impl SessionEvent {
    /// Get the event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::WaitingForOffer => "waiting_for_offer",
            SessionEvent::Notice(_) => "notice",
            SessionEvent::Error(_) => "error",
            SessionEvent::RemoteTrack(_) => "remote_track",
            SessionEvent::MediaStateChanged(_) => "media_state_changed",
            SessionEvent::Closed => "closed",
        }
    }

    /// Human-readable status line, if the event warrants one
    pub fn status_text(&self, role: Role, code: &SessionCode) -> Option<String> {
        match (self, role) {
            (
                SessionEvent::StateChanged {
                    to: SignalingState::Published,
                    ..
                },
                Role::Offerer,
            ) => Some(format!("Offer published. Code: {}", code)),
            (
                SessionEvent::StateChanged {
                    to: SignalingState::Published,
                    ..
                },
                Role::Answerer,
            ) => Some("Answer sent. Establishing connection...".to_string()),
            (SessionEvent::WaitingForOffer, _) => Some("Waiting for camera offer...".to_string()),
            (SessionEvent::Notice(Error::CodeNotFound(_)), _) => {
                Some(format!("No camera on {} yet. Still waiting...", code))
            }
            (SessionEvent::MediaStateChanged(MediaConnectionState::Connected), Role::Offerer) => {
                Some("Connected to viewer.".to_string())
            }
            (SessionEvent::RemoteTrack(_), Role::Answerer) => Some("Receiving stream.".to_string()),
            (SessionEvent::MediaStateChanged(MediaConnectionState::Failed), _) => {
                Some("Connection failed.".to_string())
            }
            (SessionEvent::Error(e), _) => Some(format!("Error: {}", e)),
            (SessionEvent::Closed, _) => Some("Idle".to_string()),
            _ => None,
        }
    }
}
