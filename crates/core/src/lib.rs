//! CamLink core signaling
//!
//! Lets a camera and a viewer find each other through a six digit session
//! code and exchange the offer, answer and ICE candidates needed to open a
//! direct media connection. Transport-agnostic: media is delegated to a
//! [`MediaEngine`] implementation, message relay to a [`RendezvousStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────┐        ┌─────────────────────────────┐
//! │  Camera (Offerer)           │        │  Viewer (Answerer)          │
//! │  CallSession                │        │  CallSession                │
//! │  ├─ dispatcher task         │        │  ├─ dispatcher task         │
//! │  │   (Offer|Answer|Cand.)   │        │  │   (Offer|Answer|Cand.)   │
//! │  └─ MediaEngine             │        │  └─ MediaEngine             │
//! └──────────┬──────────────────┘        └──────────────────┬──────────┘
//!            │ publish offer / append candidates            │
//!            ▼                                              ▼
//!      ┌──────────────────────────────────────────────────────────┐
//!      │  RendezvousStore   /sessions/{code}/{offer,answer,...}   │
//!      │  (MemoryStore | FirebaseStore)                           │
//!      └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use camlink_core::{CamLinkConfig, SessionCode};
//!
//! let code = SessionCode::generate();
//! assert_eq!(code.to_string().len(), 7);
//!
//! let config = CamLinkConfig::default();
//! assert!(config.validate().is_ok());
//! ```

#![warn(clippy::all)]

pub mod code;
pub mod codec;
pub mod config;
pub mod error;
pub mod media;
pub mod session;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use code::SessionCode;
pub use codec::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
pub use config::{CamLinkConfig, CameraFacing, IceConfig, MediaConfig, SignalingConfig, StoreBackend, TurnServer};
pub use error::{Error, ErrorKind, Result};
pub use media::{MediaConnectionState, MediaEngine, MediaEvent, RemoteTrackInfo};
pub use session::{CallSession, Role, SessionEvent, SignalingSession, SignalingState};
pub use store::{CandidateLog, FirebaseStore, LogEntry, MemoryStore, RendezvousStore, Slot, Subscription};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
