//! Signaling state and the per-call aggregate

use crate::code::SessionCode;
use crate::codec::{IceCandidate, SdpKind, SessionDescription};
use crate::store::{CandidateLog, Slot};
use std::collections::{HashSet, VecDeque};

/// Signaling state of one call
///
/// `Idle → Initializing → AwaitingLocalDescription → Published →
/// PeerDescriptionPending → Connected → Closed`. A viewer skips the two
/// offer-only states. `Closed` is terminal and reachable from everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Idle,
    Initializing,
    AwaitingLocalDescription,
    Published,
    PeerDescriptionPending,
    Connected,
    Closed,
}

impl SignalingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignalingState::Closed)
    }

    /// Whether a call can be started from this state
    pub fn can_start(&self) -> bool {
        matches!(self, SignalingState::Idle | SignalingState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingState::Idle => "idle",
            SignalingState::Initializing => "initializing",
            SignalingState::AwaitingLocalDescription => "awaiting_local_description",
            SignalingState::Published => "published",
            SignalingState::PeerDescriptionPending => "peer_description_pending",
            SignalingState::Connected => "connected",
            SignalingState::Closed => "closed",
        }
    }
}

/// Which side of the call this device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Camera: reserves the code and publishes the offer
    Offerer,
    /// Viewer: waits for the offer and publishes the answer
    Answerer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }

    /// Kind of description this side produces
    pub fn local_kind(&self) -> SdpKind {
        match self {
            Role::Offerer => SdpKind::Offer,
            Role::Answerer => SdpKind::Answer,
        }
    }

    /// Slot this side publishes to
    pub fn local_slot(&self) -> Slot {
        match self {
            Role::Offerer => Slot::Offer,
            Role::Answerer => Slot::Answer,
        }
    }

    /// Slot holding the peer's description
    pub fn peer_slot(&self) -> Slot {
        match self {
            Role::Offerer => Slot::Answer,
            Role::Answerer => Slot::Offer,
        }
    }

    /// Log this side appends its candidates to
    pub fn local_log(&self) -> CandidateLog {
        match self {
            Role::Offerer => CandidateLog::Offerer,
            Role::Answerer => CandidateLog::Answerer,
        }
    }

    /// Log holding the peer's candidates
    pub fn peer_log(&self) -> CandidateLog {
        match self {
            Role::Offerer => CandidateLog::Answerer,
            Role::Answerer => CandidateLog::Offerer,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate state of one call
#[derive(Debug, Clone)]
pub struct SignalingSession {
    pub code: SessionCode,
    pub role: Role,
    pub state: SignalingState,

    /// Flips to `true` exactly once, when the peer description is applied
    pub peer_description_applied: bool,

    pub local_description: Option<SessionDescription>,

    /// Local candidates successfully appended to the store
    pub sent_candidate_count: u64,

    /// Peer candidates received before the peer description was applied
    pub pending_candidates: VecDeque<(String, IceCandidate)>,

    /// Log ids of every peer candidate received so far
    pub seen_candidates: HashSet<String>,

    /// Whether this side reserved the namespace (and must remove it)
    pub owns_namespace: bool,

    pub(crate) media_released: bool,
    pub(crate) namespace_released: bool,
    pub(crate) teardown_complete: bool,
}

impl SignalingSession {
    pub fn new(code: SessionCode, role: Role) -> Self {
        Self {
            code,
            role,
            state: SignalingState::Idle,
            peer_description_applied: false,
            local_description: None,
            sent_candidate_count: 0,
            pending_candidates: VecDeque::new(),
            seen_candidates: HashSet::new(),
            owns_namespace: false,
            media_released: false,
            namespace_released: false,
            teardown_complete: false,
        }
    }
}
