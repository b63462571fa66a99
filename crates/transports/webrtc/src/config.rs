//! Media options for the WebRTC engine

use camlink_core::config::{CameraFacing, MediaConfig};

/// What the camera side sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaOptions {
    /// Send an Opus audio track alongside video
    pub enable_audio: bool,

    /// Video codec MIME type (e.g., "video/VP8")
    pub video_mime_type: String,

    /// Audio sample rate in Hz
    pub audio_sample_rate: u32,

    /// Audio channel count
    pub audio_channels: u16,

    /// Which camera feeds the video track; carried in the track id
    pub facing: CameraFacing,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            enable_audio: true,
            video_mime_type: "video/VP8".to_string(),
            audio_sample_rate: 48000,
            audio_channels: 2,
            facing: CameraFacing::Environment,
        }
    }
}

impl From<&MediaConfig> for MediaOptions {
    fn from(config: &MediaConfig) -> Self {
        Self {
            enable_audio: config.enable_audio,
            facing: config.facing,
            ..Default::default()
        }
    }
}
