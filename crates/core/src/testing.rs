//! Scripted media engine for tests and demos
//!
//! Behaves like a peer connection as far as signaling can tell: it hands out
//! fake descriptions, refuses candidates until a remote description is set,
//! and records every call so tests can assert on it.

use crate::codec::{IceCandidate, SdpKind, SessionDescription};
use crate::media::{MediaConnectionState, MediaEngine, MediaEvent, RemoteTrackInfo};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Everything the scripted engine was asked to do
#[derive(Debug, Clone, Default)]
pub struct MediaCalls {
    pub created: Vec<SdpKind>,
    pub applied: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub stop_calls: usize,
    pub close_calls: usize,
}

#[derive(Default)]
struct Script {
    calls: MediaCalls,
    remote_applied: bool,
    closed: bool,
    local_candidates: usize,
    reject_descriptions: bool,
    reject_candidates: bool,
    remote_track_on_apply: bool,
}

/// In-memory [`MediaEngine`] with scripted behavior
pub struct ScriptedMediaEngine {
    label: String,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
    script: Mutex<Script>,
}

impl ScriptedMediaEngine {
    pub fn new(label: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            script: Mutex::new(Script::default()),
        }
    }

    /// Report `count` local candidates right after each local description
    pub fn with_local_candidates(self, count: usize) -> Self {
        self.script.lock().local_candidates = count;
        self
    }

    /// Report a remote video track once the peer description is applied
    pub fn with_remote_track(self) -> Self {
        self.script.lock().remote_track_on_apply = true;
        self
    }

    /// Fail every remote description with `IncompatibleDescription`
    pub fn rejecting_descriptions(self) -> Self {
        self.script.lock().reject_descriptions = true;
        self
    }

    /// Fail every remote candidate with `InvalidCandidate`
    pub fn rejecting_candidates(self) -> Self {
        self.script.lock().reject_candidates = true;
        self
    }

    /// Raise a media event as if the engine produced it
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Copy of the calls made so far
    pub fn calls(&self) -> MediaCalls {
        self.script.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.script.lock().closed
    }

    /// Candidate line this engine reports as its `index`th local candidate
    pub fn candidate_line(label: &str, index: usize) -> String {
        format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} {} typ host",
            label.len() + index,
            index + 1,
            50000 + index
        )
    }
}

#[async_trait]
impl MediaEngine for ScriptedMediaEngine {
    async fn create_local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        let local_candidates = {
            let mut script = self.script.lock();
            if script.closed {
                return Err(Error::MediaError("connection closed".to_string()));
            }
            if kind == SdpKind::Answer && !script.remote_applied {
                return Err(Error::IncompatibleDescription(
                    "cannot answer before an offer is applied".to_string(),
                ));
            }
            script.calls.created.push(kind);
            script.local_candidates
        };

        for index in 0..local_candidates {
            let mut candidate = IceCandidate::new(Self::candidate_line(&self.label, index));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_mline_index = Some(0);
            self.emit(MediaEvent::LocalCandidate(candidate));
        }
        self.emit(MediaEvent::CandidateGatheringComplete);

        Ok(SessionDescription {
            kind,
            sdp: format!("v=0\r\ns={}-{}\r\n", self.label, kind.as_str()),
        })
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote_track = {
            let mut script = self.script.lock();
            if script.reject_descriptions {
                return Err(Error::IncompatibleDescription(format!(
                    "{} rejected by {}",
                    description.kind.as_str(),
                    self.label
                )));
            }
            script.calls.applied.push(description);
            script.remote_applied = true;
            script.remote_track_on_apply
        };

        self.emit(MediaEvent::ConnectionStateChanged(
            MediaConnectionState::Connecting,
        ));
        if remote_track {
            self.emit(MediaEvent::RemoteTrack(RemoteTrackInfo {
                track_id: format!("{}-video", self.label),
                stream_id: format!("{}-stream", self.label),
                kind: "video".to_string(),
            }));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut script = self.script.lock();
        if !script.remote_applied {
            return Err(Error::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        if script.reject_candidates {
            return Err(Error::InvalidCandidate(candidate.candidate));
        }
        script.calls.candidates.push(candidate);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events_rx.lock().take()
    }

    async fn stop_local_media(&self) -> Result<()> {
        self.script.lock().calls.stop_calls += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut script = self.script.lock();
        script.calls.close_calls += 1;
        script.closed = true;
        Ok(())
    }
}
