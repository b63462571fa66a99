//! In-process rendezvous store
//!
//! Used by the `demo` command (both roles in one process) and by tests. All
//! state sits behind one lock, so "deliver current value, then register the
//! watcher" is atomic and two racing `create_namespace` calls serialize.

use super::{CandidateLog, LogEntry, NamespaceRecord, RendezvousStore, Slot, Subscription};
use crate::code::SessionCode;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, trace};

#[derive(Default)]
struct Namespace {
    record: Option<NamespaceRecord>,
    slots: HashMap<Slot, Value>,
    logs: HashMap<CandidateLog, Vec<LogEntry>>,
}

#[derive(Default)]
struct Inner {
    namespaces: HashMap<String, Namespace>,
    slot_watchers: HashMap<(String, Slot), Vec<UnboundedSender<Value>>>,
    log_watchers: HashMap<(String, CandidateLog), Vec<UnboundedSender<LogEntry>>>,
    next_id: u64,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::StoreUnavailable(
                "memory store switched offline".to_string(),
            ));
        }
        Ok(())
    }

    /// Forget watchers whose subscription was dropped
    fn prune_watchers(&mut self) {
        self.slot_watchers.retain(|_, watchers| {
            watchers.retain(|tx| !tx.is_closed());
            !watchers.is_empty()
        });
        self.log_watchers.retain(|_, watchers| {
            watchers.retain(|tx| !tx.is_closed());
            !watchers.is_empty()
        });
    }

    fn notify_slot(&mut self, key: &str, slot: Slot, value: &Value) {
        if let Some(watchers) = self.slot_watchers.get_mut(&(key.to_string(), slot)) {
            watchers.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }

    fn notify_log(&mut self, key: &str, log: CandidateLog, entry: &LogEntry) {
        if let Some(watchers) = self.log_watchers.get_mut(&(key.to_string(), log)) {
            watchers.retain(|tx| tx.send(entry.clone()).is_ok());
        }
    }
}

/// Rendezvous store held entirely in memory
///
/// # Example
///
/// ```
/// use camlink_core::{MemoryStore, RendezvousStore, SessionCode, Slot};
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new();
/// let code = SessionCode::parse("482-913").unwrap();
///
/// store.create_namespace(&code).await.unwrap();
/// assert!(store.create_namespace(&code).await.is_err());
///
/// let mut offers = store.subscribe_slot(&code, Slot::Offer).await.unwrap();
/// store
///     .publish(&code, Slot::Offer, serde_json::json!({ "type": "offer", "sdp": "v=0" }))
///     .await
///     .unwrap();
/// assert_eq!(offers.recv().await.unwrap()["type"], "offer");
/// # });
/// ```
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming reachable or unreachable
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }

    /// Deliver the current value of a slot to its watchers again
    pub fn redeliver_slot(&self, code: &SessionCode, slot: Slot) {
        let mut inner = self.inner.lock();
        let key = code.to_string();
        let current = inner
            .namespaces
            .get(&key)
            .and_then(|ns| ns.slots.get(&slot))
            .cloned();
        if let Some(value) = current {
            trace!(code = %code, slot = slot.key(), "Redelivering slot");
            inner.notify_slot(&key, slot, &value);
        }
    }

    /// Deliver every entry of a log to its watchers again
    pub fn redeliver_log(&self, code: &SessionCode, log: CandidateLog) {
        let mut inner = self.inner.lock();
        let key = code.to_string();
        let entries = inner
            .namespaces
            .get(&key)
            .and_then(|ns| ns.logs.get(&log))
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            inner.notify_log(&key, log, entry);
        }
    }

    /// Whether a namespace currently exists under the code
    pub fn contains_namespace(&self, code: &SessionCode) -> bool {
        self.inner.lock().namespaces.contains_key(&code.to_string())
    }

    /// Record written when the namespace was reserved, if it was
    pub fn namespace_record(&self, code: &SessionCode) -> Option<NamespaceRecord> {
        self.inner
            .lock()
            .namespaces
            .get(&code.to_string())
            .and_then(|ns| ns.record)
    }

    /// Current value of a slot
    pub fn slot_value(&self, code: &SessionCode, slot: Slot) -> Option<Value> {
        self.inner
            .lock()
            .namespaces
            .get(&code.to_string())
            .and_then(|ns| ns.slots.get(&slot))
            .cloned()
    }

    /// Entries of a log in append order
    pub fn log_entries(&self, code: &SessionCode, log: CandidateLog) -> Vec<LogEntry> {
        self.inner
            .lock()
            .namespaces
            .get(&code.to_string())
            .and_then(|ns| ns.logs.get(&log))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of subscriptions under the code whose receiver is still alive
    pub fn active_watchers(&self, code: &SessionCode) -> usize {
        let inner = self.inner.lock();
        let key = code.to_string();
        let slots: usize = inner
            .slot_watchers
            .iter()
            .filter(|((k, _), _)| *k == key)
            .map(|(_, watchers)| watchers.iter().filter(|tx| !tx.is_closed()).count())
            .sum();
        let logs: usize = inner
            .log_watchers
            .iter()
            .filter(|((k, _), _)| *k == key)
            .map(|(_, watchers)| watchers.iter().filter(|tx| !tx.is_closed()).count())
            .sum();
        slots + logs
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn create_namespace(&self, code: &SessionCode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        let key = code.to_string();
        if inner.namespaces.contains_key(&key) {
            return Err(Error::CodeConflict(key));
        }

        inner.namespaces.insert(
            key,
            Namespace {
                record: Some(NamespaceRecord::now()),
                ..Default::default()
            },
        );
        debug!(code = %code, "Namespace reserved");
        Ok(())
    }

    async fn publish(&self, code: &SessionCode, slot: Slot, value: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        let key = code.to_string();
        inner
            .namespaces
            .entry(key.clone())
            .or_default()
            .slots
            .insert(slot, value.clone());
        inner.notify_slot(&key, slot, &value);
        Ok(())
    }

    async fn append(&self, code: &SessionCode, log: CandidateLog, value: Value) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        inner.next_id += 1;
        let entry = LogEntry {
            id: format!("{:020}", inner.next_id),
            value,
        };

        let key = code.to_string();
        inner
            .namespaces
            .entry(key.clone())
            .or_default()
            .logs
            .entry(log)
            .or_default()
            .push(entry.clone());
        inner.notify_log(&key, log, &entry);
        Ok(entry.id)
    }

    async fn subscribe_slot(&self, code: &SessionCode, slot: Slot) -> Result<Subscription<Value>> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        inner.prune_watchers();

        let key = code.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(value) = inner.namespaces.get(&key).and_then(|ns| ns.slots.get(&slot)) {
            // Receiver is alive, send cannot fail
            let _ = tx.send(value.clone());
        }
        inner.slot_watchers.entry((key, slot)).or_default().push(tx);
        Ok(Subscription::new(rx))
    }

    async fn subscribe_appends(
        &self,
        code: &SessionCode,
        log: CandidateLog,
    ) -> Result<Subscription<LogEntry>> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        inner.prune_watchers();

        let key = code.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(entries) = inner.namespaces.get(&key).and_then(|ns| ns.logs.get(&log)) {
            for entry in entries {
                let _ = tx.send(entry.clone());
            }
        }
        inner.log_watchers.entry((key, log)).or_default().push(tx);
        Ok(Subscription::new(rx))
    }

    async fn remove_namespace(&self, code: &SessionCode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        if inner.namespaces.remove(&code.to_string()).is_some() {
            debug!(code = %code, "Namespace removed");
        }
        inner.prune_watchers();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn code(s: &str) -> SessionCode {
        SessionCode::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_namespace_conflict() {
        let store = MemoryStore::new();
        let code = code("111-111");
        store.create_namespace(&code).await.unwrap();
        assert!(store.namespace_record(&code).unwrap().created_at > 0);
        let err = store.create_namespace(&code).await.unwrap_err();
        assert!(matches!(err, Error::CodeConflict(_)));
    }

    #[tokio::test]
    async fn test_remove_then_recreate() {
        let store = MemoryStore::new();
        let code = code("123-456");
        store.remove_namespace(&code).await.unwrap();
        store.create_namespace(&code).await.unwrap();
        store.remove_namespace(&code).await.unwrap();
        assert!(!store.contains_namespace(&code));
        store.create_namespace(&code).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_slot_delivers_current_then_updates() {
        let store = MemoryStore::new();
        let code = code("482-913");
        store.publish(&code, Slot::Offer, json!({ "n": 1 })).await.unwrap();

        let mut sub = store.subscribe_slot(&code, Slot::Offer).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), json!({ "n": 1 }));

        store.publish(&code, Slot::Offer, json!({ "n": 2 })).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), json!({ "n": 2 }));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_appends_replays_from_start() {
        let store = MemoryStore::new();
        let code = code("482-913");
        let first = store
            .append(&code, CandidateLog::Offerer, json!("a"))
            .await
            .unwrap();
        let second = store
            .append(&code, CandidateLog::Offerer, json!("b"))
            .await
            .unwrap();
        assert!(first < second);

        let mut sub = store
            .subscribe_appends(&code, CandidateLog::Offerer)
            .await
            .unwrap();
        store
            .append(&code, CandidateLog::Offerer, json!("c"))
            .await
            .unwrap();

        let mut values = Vec::new();
        while let Some(entry) = sub.try_recv() {
            values.push(entry.value);
        }
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.create_namespace(&code("222-222")).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        store.set_available(true);
        assert!(store.create_namespace(&code("222-222")).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_not_active() {
        let store = MemoryStore::new();
        let code = code("333-333");
        let sub = store.subscribe_slot(&code, Slot::Answer).await.unwrap();
        assert_eq!(store.active_watchers(&code), 1);
        drop(sub);
        assert_eq!(store.active_watchers(&code), 0);
    }

    #[tokio::test]
    async fn test_dropped_watchers_pruned_without_publish() {
        let store = MemoryStore::new();
        let code = code("000-000");
        let offers = store.subscribe_slot(&code, Slot::Offer).await.unwrap();
        let candidates = store
            .subscribe_appends(&code, CandidateLog::Offerer)
            .await
            .unwrap();
        drop(offers);
        drop(candidates);

        store.remove_namespace(&code).await.unwrap();
        {
            let inner = store.inner.lock();
            assert!(inner.slot_watchers.is_empty());
            assert!(inner.log_watchers.is_empty());
        }

        // A new subscription also sweeps stale ones
        let stale = store.subscribe_slot(&code, Slot::Answer).await.unwrap();
        drop(stale);
        let _live = store.subscribe_slot(&code, Slot::Offer).await.unwrap();
        let inner = store.inner.lock();
        assert_eq!(inner.slot_watchers.len(), 1);
        assert!(inner.slot_watchers.contains_key(&(code.to_string(), Slot::Offer)));
    }

    #[tokio::test]
    async fn test_concurrent_reservation_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let code = code("111-111");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let code = code.clone();
                tokio::spawn(async move { store.create_namespace(&code).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(e) => assert!(matches!(e, Error::CodeConflict(_))),
            }
        }
        assert_eq!(winners, 1);
    }
}
