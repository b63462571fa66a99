//! Rendezvous store abstraction
//!
//! The store is an opaque keyed publish/subscribe relay. Everything belonging
//! to one call lives under a namespace addressed by its session code:
//!
//! ```text
//! /sessions/{code}                          { createdAt: unixMillis }
//! /sessions/{code}/offer                    { type: "offer",  sdp }
//! /sessions/{code}/answer                   { type: "answer", sdp }
//! /sessions/{code}/candidates/offerer/{id}  { candidate, sdpMid, ... }
//! /sessions/{code}/candidates/answerer/{id} { candidate, sdpMid, ... }
//! ```
//!
//! Delivery is at-least-once. Slot subscriptions deliver the current value
//! first (if any) and then every overwrite; log subscriptions replay every
//! entry from the start, in append order. Consumers must tolerate duplicates.

pub mod firebase;
pub mod memory;

pub use firebase::{FirebaseStore, FirebaseStoreConfig};
pub use memory::MemoryStore;

use crate::code::SessionCode;
use crate::codec::SdpKind;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Root under which all session namespaces live
pub const SESSIONS_ROOT: &str = "sessions";

/// Single-valued, overwritable slot of a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Offer,
    Answer,
}

impl Slot {
    /// Key of the slot inside the namespace
    pub fn key(&self) -> &'static str {
        match self {
            Slot::Offer => "offer",
            Slot::Answer => "answer",
        }
    }

    /// Kind of description stored in this slot
    pub fn kind(&self) -> SdpKind {
        match self {
            Slot::Offer => SdpKind::Offer,
            Slot::Answer => SdpKind::Answer,
        }
    }
}

/// Append-only candidate log of a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateLog {
    Offerer,
    Answerer,
}

impl CandidateLog {
    /// Key of the log inside the namespace
    pub fn key(&self) -> &'static str {
        match self {
            CandidateLog::Offerer => "candidates/offerer",
            CandidateLog::Answerer => "candidates/answerer",
        }
    }
}

/// Path of a session namespace, e.g. `sessions/482-913`
pub fn namespace_path(code: &SessionCode) -> String {
    format!("{}/{}", SESSIONS_ROOT, code)
}

/// Path of a slot, e.g. `sessions/482-913/offer`
pub fn slot_path(code: &SessionCode, slot: Slot) -> String {
    format!("{}/{}", namespace_path(code), slot.key())
}

/// Path of a candidate log, e.g. `sessions/482-913/candidates/offerer`
pub fn log_path(code: &SessionCode, log: CandidateLog) -> String {
    format!("{}/{}", namespace_path(code), log.key())
}

/// Record written when a namespace is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRecord {
    pub created_at: i64,
}

impl NamespaceRecord {
    pub fn now() -> Self {
        Self {
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One entry of a candidate log
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Store-assigned id, unique within the log and ordered by append time
    pub id: String,
    pub value: Value,
}

/// A live store subscription
///
/// Values arrive in delivery order. Dropping the subscription (or calling
/// [`Subscription::cancel`]) unsubscribes; nothing is delivered afterwards.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    task: Option<JoinHandle<()>>,
}

impl<T> Subscription<T> {
    /// Subscription fed directly through a channel
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, task: None }
    }

    /// Subscription fed by a background task, aborted on drop
    pub fn with_task(rx: mpsc::UnboundedReceiver<T>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Wait for the next delivery; `None` once the store side has ended
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take a delivery if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribe
    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Keyed publish/subscribe store used to relay signaling messages
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Reserve a namespace; fails with `CodeConflict` if it is already in use
    async fn create_namespace(&self, code: &SessionCode) -> Result<()>;

    /// Overwrite a slot (last write wins)
    async fn publish(&self, code: &SessionCode, slot: Slot, value: Value) -> Result<()>;

    /// Append one entry to a candidate log, returning its id
    async fn append(&self, code: &SessionCode, log: CandidateLog, value: Value) -> Result<String>;

    /// Subscribe to the current value and every later overwrite of a slot
    async fn subscribe_slot(&self, code: &SessionCode, slot: Slot) -> Result<Subscription<Value>>;

    /// Subscribe to every entry of a log, replayed from the start
    async fn subscribe_appends(
        &self,
        code: &SessionCode,
        log: CandidateLog,
    ) -> Result<Subscription<LogEntry>>;

    /// Delete the namespace and everything under it; succeeds if absent
    async fn remove_namespace(&self, code: &SessionCode) -> Result<()>;
}
