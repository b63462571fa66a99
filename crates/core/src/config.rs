//! Configuration types for CamLink

use crate::store::{FirebaseStore, FirebaseStoreConfig, MemoryStore, RendezvousStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Top-level configuration, loadable from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CamLinkConfig {
    pub store: StoreConfig,
    pub ice: IceConfig,
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
}

/// Which rendezvous store to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; both peers must live in the same process
    Memory,
    /// Firebase Realtime Database over REST
    Firebase,
}

/// Rendezvous store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Database root URL (Firebase backend only)
    pub database_url: String,

    /// Database secret or ID token (Firebase backend only)
    pub auth_token: Option<String>,

    /// Timeout for one-shot store requests in seconds
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: String::new(),
            auth_token: None,
            request_timeout_secs: 10,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URL (e.g., "turn:turn.example.com:3478")
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// ICE server settings handed to the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs (e.g., "stun:stun.l.google.com:19302")
    pub stun_servers: Vec<String>,

    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
        }
    }
}

impl IceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN URL must start with 'stun:' or 'stuns:': {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN URL must start with 'turn:' or 'turns:': {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }
}

/// Signaling engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Seconds a viewer waits for an offer before it is told the code is not
    /// (yet) in use. `0` disables the notice. The subscription continues
    /// either way.
    pub offer_wait_notice_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            offer_wait_notice_secs: 30,
        }
    }
}

impl SignalingConfig {
    pub fn offer_wait_notice(&self) -> Option<Duration> {
        (self.offer_wait_notice_secs > 0).then(|| Duration::from_secs(self.offer_wait_notice_secs))
    }
}

/// Which camera the sender prefers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    User,
    #[default]
    Environment,
}

impl CameraFacing {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraFacing::User => "user",
            CameraFacing::Environment => "environment",
        }
    }
}

impl std::fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CameraFacing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "front" => Ok(CameraFacing::User),
            "environment" | "back" | "rear" => Ok(CameraFacing::Environment),
            other => Err(Error::InvalidConfig(format!(
                "camera facing must be 'user' or 'environment', got '{}'",
                other
            ))),
        }
    }
}

/// Local media settings for the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Send an audio track alongside video
    pub enable_audio: bool,

    pub facing: CameraFacing,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enable_audio: true,
            facing: CameraFacing::Environment,
        }
    }
}

impl CamLinkConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| Error::InvalidConfig(format!("TOML: {}", e)))
    }

    /// Load a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&input)
    }

    /// Apply `CAMLINK_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup
    ///
    /// `CAMLINK_DATABASE_URL` also switches the backend to Firebase.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("CAMLINK_DATABASE_URL").filter(|v| !v.is_empty()) {
            self.store.backend = StoreBackend::Firebase;
            self.store.database_url = url;
        }
        if let Some(token) = lookup("CAMLINK_AUTH_TOKEN").filter(|v| !v.is_empty()) {
            self.store.auth_token = Some(token);
        }
        if let Some(servers) = lookup("CAMLINK_STUN_SERVERS") {
            self.ice.stun_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(facing) = lookup("CAMLINK_FACING") {
            match facing.parse() {
                Ok(facing) => self.media.facing = facing,
                Err(e) => warn!("Ignoring CAMLINK_FACING: {}", e),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Firebase {
            if self.store.database_url.is_empty() {
                return Err(Error::InvalidConfig(
                    "database_url is required for the firebase backend".to_string(),
                ));
            }
            if !self.store.database_url.starts_with("https://") {
                return Err(Error::InvalidConfig(format!(
                    "database_url must be https: {}",
                    self.store.database_url
                )));
            }
        }

        if self.store.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.ice.validate()
    }

    /// Build the configured rendezvous store
    pub fn build_store(&self) -> Result<Arc<dyn RendezvousStore>> {
        self.validate()?;
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Firebase => Ok(Arc::new(FirebaseStore::new(FirebaseStoreConfig {
                database_url: self.store.database_url.clone(),
                auth_token: self.store.auth_token.clone(),
                request_timeout: Duration::from_secs(self.store.request_timeout_secs),
            })?)),
        }
    }
}
