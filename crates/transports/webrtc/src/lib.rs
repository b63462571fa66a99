//! CamLink WebRTC media engine
//!
//! Implements [`camlink_core::MediaEngine`] on top of webrtc-rs. The camera
//! side publishes VP8 video (and optionally Opus audio) tracks, the viewer
//! side receives them. Signaling is left entirely to `camlink-core`.
//!
//! ```text
//! CallSession ──create/apply/add──▶ WebRtcMediaEngine ──▶ RTCPeerConnection
//!      ▲                                   │
//!      └──── MediaEvent (candidates, tracks, state) ◀┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use camlink_core::{IceConfig, MediaEngine, Role, SdpKind};
//! use camlink_webrtc::{MediaOptions, WebRtcMediaEngine};
//!
//! # tokio_test::block_on(async {
//! let engine = WebRtcMediaEngine::new(Role::Offerer, &IceConfig::default(), MediaOptions::default())
//!     .await
//!     .unwrap();
//! let offer = engine.create_local_description(SdpKind::Offer).await.unwrap();
//! assert!(offer.sdp.contains("m=video"));
//! engine.close().await.unwrap();
//! # });
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod peer;

pub use config::MediaOptions;
pub use peer::WebRtcMediaEngine;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
