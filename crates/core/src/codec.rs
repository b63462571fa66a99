//! Message codec
//!
//! Converts session descriptions and ICE candidates to and from the JSON
//! values persisted in the rendezvous store. The shapes match what a browser
//! peer writes (`RTCSessionDescription` and `RTCIceCandidate.toJSON()`), so a
//! native peer and a web peer can share one session.
//!
//! Decoding never panics: any value that does not match the expected shape
//! yields [`Error::MalformedMessage`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which half of the offer/answer exchange a description is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// One side's proposed media parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One discovered network path, in `RTCIceCandidateInit` form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// A decoded peer message, as dispatched inside the signaling engine
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    /// A candidate together with the store id of its log entry
    Candidate { id: String, candidate: IceCandidate },
}

impl SignalMessage {
    /// Wrap a description in the variant matching its kind
    pub fn description(description: SessionDescription) -> Self {
        match description.kind {
            SdpKind::Offer => SignalMessage::Offer(description),
            SdpKind::Answer => SignalMessage::Answer(description),
        }
    }

    /// Get the message kind name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::Candidate { .. } => "candidate",
        }
    }
}

/// Encode a description for the `offer`/`answer` slot
pub fn encode_description(description: &SessionDescription) -> Result<Value> {
    Ok(serde_json::to_value(description)?)
}

/// Decode a description read from the slot holding `expected` descriptions
pub fn decode_description(expected: SdpKind, value: &Value) -> Result<SessionDescription> {
    let description: SessionDescription = serde_json::from_value(value.clone())
        .map_err(|e| Error::MalformedMessage(format!("{} description: {}", expected.as_str(), e)))?;

    if description.kind != expected {
        return Err(Error::MalformedMessage(format!(
            "expected {} description, found {}",
            expected.as_str(),
            description.kind.as_str()
        )));
    }

    if description.sdp.trim().is_empty() {
        return Err(Error::MalformedMessage(format!(
            "{} description has an empty sdp",
            expected.as_str()
        )));
    }

    Ok(description)
}

/// Encode a candidate for a candidate log
pub fn encode_candidate(candidate: &IceCandidate) -> Result<Value> {
    Ok(serde_json::to_value(candidate)?)
}

/// Decode a candidate log entry
pub fn decode_candidate(value: &Value) -> Result<IceCandidate> {
    let candidate: IceCandidate = serde_json::from_value(value.clone())
        .map_err(|e| Error::MalformedMessage(format!("candidate: {}", e)))?;

    if candidate.candidate.trim().is_empty() {
        return Err(Error::MalformedMessage(
            "candidate entry has an empty candidate line".to_string(),
        ));
    }

    Ok(candidate)
}
