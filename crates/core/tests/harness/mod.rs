//! Signaling test harness
//!
//! Wires `CallSession`s to a shared `MemoryStore` and scripted media engines,
//! and provides polling helpers for asserting on asynchronous progress.
//!
//! Basic usage pattern:
//!
//! 1. Create a `MemoryStore` and one `TestPeer` per side
//! 2. Start the peers with `start_offerer` / `start_answerer`
//! 3. Wait for states with `wait_for_state` or events with `next_event`
//! 4. Assert on `peer.media.calls()` and the store contents

#![allow(dead_code)]

use camlink_core::testing::ScriptedMediaEngine;
use camlink_core::{
    CallSession, MediaEngine, MemoryStore, RendezvousStore, SessionCode, SessionEvent, SignalingConfig,
    SignalingState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// One side of a call under test
pub struct TestPeer {
    pub session: CallSession,
    pub media: Arc<ScriptedMediaEngine>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl TestPeer {
    pub fn new(store: &Arc<MemoryStore>, media: ScriptedMediaEngine) -> Self {
        Self::with_config(store, media, quiet_config())
    }

    pub fn with_config(
        store: &Arc<MemoryStore>,
        media: ScriptedMediaEngine,
        config: SignalingConfig,
    ) -> Self {
        Self::with_store(Arc::clone(store) as Arc<dyn RendezvousStore>, media, config)
    }

    /// Peer over any store, e.g. a wrapper that injects latency
    pub fn with_store(
        store: Arc<dyn RendezvousStore>,
        media: ScriptedMediaEngine,
        config: SignalingConfig,
    ) -> Self {
        let mut session = CallSession::new(store, config);
        let events = session.take_events().expect("events taken once");
        Self {
            session,
            media: Arc::new(media),
            events,
        }
    }

    pub async fn start_offerer(&mut self, code: &SessionCode) -> camlink_core::Result<()> {
        self.session
            .start_offerer(code.clone(), Arc::clone(&self.media) as Arc<dyn MediaEngine>)
            .await
    }

    pub async fn start_answerer(&mut self, code: &SessionCode) -> camlink_core::Result<()> {
        self.session
            .start_answerer(code.clone(), Arc::clone(&self.media) as Arc<dyn MediaEngine>)
            .await
    }

    /// Swap in a fresh media engine for the next call
    pub fn replace_media(&mut self, media: ScriptedMediaEngine) {
        self.media = Arc::new(media);
    }

    pub async fn wait_for_state(&self, state: SignalingState) -> bool {
        wait_until(|| self.session.state() == state).await
    }

    /// Next event matching `pred`, skipping the others
    pub async fn next_event(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> Option<SessionEvent> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .ok()??;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    /// Every event already queued
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Signaling config without the "no offer yet" notice
pub fn quiet_config() -> SignalingConfig {
    SignalingConfig {
        offer_wait_notice_secs: 0,
    }
}

pub fn code(s: &str) -> SessionCode {
    SessionCode::parse(s).expect("valid code")
}

/// Poll `cond` until it holds or `WAIT` elapses
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Give spawned tasks a chance to process queued input
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,camlink_core=debug")
        .with_test_writer()
        .try_init();
}
